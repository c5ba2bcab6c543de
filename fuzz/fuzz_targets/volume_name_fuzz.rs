#![no_main]
use kwvolume::modules::plugin::validate_name;
use libfuzzer_sys::fuzz_target;
use std::path::{Component, Path};

fuzz_target!(|data: &[u8]| {
    if let Ok(name) = std::str::from_utf8(data) {
        if validate_name(name).is_ok() {
            // An accepted name is exactly one normal component under the root
            let root = Path::new("/var/lib/docker-volumes/_keywhiz");
            let joined = root.join(name);
            assert_eq!(joined.parent(), Some(root));
            assert!(matches!(
                joined.components().last(),
                Some(Component::Normal(_))
            ));
        }
    }
});
