#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod classify;
pub mod client;
pub mod connection;
pub mod error;
pub mod listener;
pub mod store;

pub use client::{Client, Config};

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;
