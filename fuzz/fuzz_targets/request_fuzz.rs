#![no_main]
use kwvolume::modules::plugin::{decode_request, validate_name, Route};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Bodies must decode or fail cleanly, never panic
    if let Ok(request) = decode_request(data) {
        if validate_name(&request.name).is_ok() {
            assert!(!request.name.contains('/'));
        }
    }

    if let Ok(path) = std::str::from_utf8(data) {
        let _ = Route::from_path(path);
    }
});
