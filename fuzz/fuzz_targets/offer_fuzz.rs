#![no_main]
use libfuzzer_sys::fuzz_target;
use peermount::{resolve, Location, MountOffer};
use std::path::Path;

fuzz_target!(|data: &[u8]| {
    // Treat fuzzer data as an offer packet body
    if let Ok(body) = serde_json::from_slice::<serde_json::Value>(data) {
        if let Ok(offer) = MountOffer::from_body(&body) {
            let local = resolve(&offer, Location::Local(Path::new("/run/user/1000/peermount/fuzz")));
            let remote = resolve(
                &offer,
                Location::Remote {
                    host: "10.0.0.2",
                    port: offer.port,
                },
            );

            // Both locations publish the same names
            if let (Ok(local), Ok(remote)) = (local, remote) {
                let names: Vec<_> = local.iter().map(|(name, _)| name).collect();
                let other: Vec<_> = remote.iter().map(|(name, _)| name).collect();
                assert_eq!(names, other);
            }
        }
    }
});
