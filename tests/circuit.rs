/*!
 * Circuit tests entry point
 */

#[path = "circuit/common.rs"]
mod common;

#[path = "circuit/colocated_test.rs"]
mod colocated_test;

#[path = "circuit/zero_copy_test.rs"]
mod zero_copy_test;

#[path = "circuit/remote_test.rs"]
mod remote_test;

#[path = "circuit/ofed_test.rs"]
mod ofed_test;

#[path = "circuit/socket_test.rs"]
mod socket_test;

#[path = "circuit/admission_test.rs"]
mod admission_test;
