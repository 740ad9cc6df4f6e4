//! Criterion benchmarks for the management configuration payload.
//!
//! Run with:
//! ```bash
//! cargo bench --package keylink-core --bench tlv_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use keylink_core::management::{build_write_payload, encode_read_response, parse_read_response};
use keylink_core::{Capability, DeviceConfig, DeviceInfo, FormFactor, Interface, Version};

fn make_device_info() -> DeviceInfo {
    let mut info = DeviceInfo {
        serial: Some(12_345_678),
        version: Some(Version::new(5, 4, 3)),
        form_factor: Some(FormFactor::UsbCKeychain),
        auto_eject_timeout: Some(0),
        challenge_response_timeout: Some(15),
        device_flags: Some(0),
        ..DeviceInfo::default()
    };
    for interface in Interface::ALL {
        info.capabilities.supported.insert(interface, Capability::all());
        info.capabilities.enabled.insert(interface, Capability::OATH | Capability::FIDO2);
    }
    info
}

fn bench_read(c: &mut Criterion) {
    let payload = encode_read_response(&make_device_info()).expect("fixture must encode");
    c.bench_function("parse_read_response", |b| {
        b.iter(|| parse_read_response(black_box(&payload)).unwrap())
    });
}

fn bench_write(c: &mut Criterion) {
    let config = DeviceConfig::from_record(&make_device_info().capabilities).with_reboot(true);
    c.bench_function("build_write_payload", |b| {
        b.iter(|| build_write_payload(black_box(&config)).unwrap())
    });
}

criterion_group!(benches, bench_read, bench_write);
criterion_main!(benches);
