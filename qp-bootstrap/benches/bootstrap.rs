use criterion::{Criterion, criterion_group, criterion_main};
use qp_bootstrap::provider::Gid;
use qp_bootstrap::provider::soft::SoftFabric;
use qp_bootstrap::{
    DESCRIPTOR_LEN, EndpointDescriptor, Initiator, ProviderContext, Responder, SessionConfig,
    TransferMode,
};
use std::hint;
use std::net::{Ipv4Addr, TcpListener};
use std::thread;
use std::time::Duration;

fn descriptor_codec(c: &mut Criterion) {
    let descriptor = EndpointDescriptor {
        queue_identity: 0x11,
        remote_access_key: 0x2233,
        buffer_address: 0x7f00_dead_0000,
        network_identity: Gid::new([0xfe; 16]),
    };
    let bytes: [u8; DESCRIPTOR_LEN] = descriptor.to_bytes();

    let mut group = c.benchmark_group("EndpointDescriptor");
    group.bench_function("encode", |b| {
        b.iter(|| hint::black_box(&descriptor).to_bytes())
    });
    group.bench_function("decode", |b| {
        b.iter(|| EndpointDescriptor::from_bytes(hint::black_box(bytes)))
    });
    group.finish();
}

fn loopback_bootstrap(c: &mut Criterion) {
    let fabric = SoftFabric::new();
    let server = ProviderContext::new(fabric.open_device("soft0"));
    let client = ProviderContext::new(fabric.open_device("soft1"));
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut group = c.benchmark_group("Bootstrap");
    for mode in [TransferMode::SendRecv, TransferMode::RemoteRead] {
        let config = SessionConfig::new(mode);
        let responder = Responder::new(&server, config.clone()).unwrap();
        let initiator = Initiator::new(&client, config).unwrap();

        group.bench_function(format!("{mode} loopback"), |b| {
            b.iter(|| {
                thread::scope(|s| {
                    let served = s.spawn(|| responder.accept(&listener).unwrap());
                    let connected = initiator.connect(addr).unwrap();
                    hint::black_box((served.join().unwrap(), connected))
                })
            })
        });
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .sample_size(20)
        .warm_up_time(Duration::from_secs(1));
    targets = descriptor_codec, loopback_bootstrap
}
criterion_main!(benches);
