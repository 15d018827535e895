#![allow(dead_code)]

pub mod dialer;
pub mod dropbox;
pub mod handle;
pub mod message;
pub mod names;
pub mod proxy;
pub mod worker;
