//! Unit tests for the nested SVM vcpu.
//!
//! The tests drive a vcpu against [`mock::MockOps`], which keeps guest memory
//! in host heap pages and records what the vcpu asks the host to do.


mod check;
mod interrupt;
mod permission;
