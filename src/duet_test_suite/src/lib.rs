//! Test suite for duet kernel ports.
//!
//! Each test case is a module in [`kernel_tests`] providing an `App` type,
//! which holds the kernel objects used by the test, and a `main` function,
//! which is the entry point of the main thread. A port harness instantiates
//! the kernel for every test case by invoking [`get_kernel_tests!`].
#![cfg_attr(not(test), no_std)]
pub mod kernel_tests;
mod utils;
