//! End-to-end tests: whole nodes on an in-process network.
//!
//! Each test file covers one scenario. Housekeeping never ticks on its own;
//! tests drive it explicitly and move message age with a shared manual
//! clock.

#![cfg(test)]

mod helpers;

mod test_first_node;
mod test_live_query;
mod test_message_resend;
mod test_node_join;
mod test_rpc;
mod test_update_system;
