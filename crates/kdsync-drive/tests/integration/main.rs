//! Integration tests for kdsync-drive
//!
//! Uses wiremock to simulate the drive API and verifies end-to-end
//! behavior of the full listing, cursor continuation, long-poll and
//! file-info requests.

mod common;

mod test_changes;
mod test_listing;
