//! Emit a warning when FUSE-dependent tests are skipped.
//!
//! The kernel-facing adapter and its unit tests live under `src/fuse` and are
//! compiled only with the `fuse` feature. This companion file makes the
//! missing coverage visible when running `cargo test --no-default-features`.

#[cfg(not(feature = "fuse"))]
#[test]
fn fuse_tests_skipped_warning() {
    eprintln!(
        "\n\x1b[33mwarning\x1b[0m: Skipping FUSE adapter tests: built without `fuse` feature.\n\
         To run them, build with: cargo test --features fuse\n"
    );
}

#[cfg(feature = "fuse")]
#[test]
fn fuse_errno_mapping_available() {
    use confstore_daemon::FsStatus;

    assert_eq!(FsStatus::NotADirectory.to_errno(), libc::ENOTDIR);
    assert_eq!(FsStatus::Io.to_errno(), libc::EIO);
}
