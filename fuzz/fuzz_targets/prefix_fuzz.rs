#![no_main]
use libfuzzer_sys::fuzz_target;
use peermount::modules::offer::{common_prefix, join_uri};

fuzz_target!(|paths: Vec<String>| {
    let split = common_prefix(&paths);
    assert_eq!(split.residuals.len(), paths.len());

    for residual in &split.residuals {
        assert!(residual.starts_with('/'));
        let _ = join_uri(&split.root, residual);
    }
});
