use criterion::{criterion_group, criterion_main, Criterion};
use time::OffsetDateTime;
use yard_inventory_core::{group_by_vessel_key, Shipment, ShipmentId, VesselId};

const VESSELS: [&str; 4] = ["Ever Given", "MAERSK ESSEN ", "msc gülsün", "CMA CGM Marco Polo"];

fn mk_shipment(index: usize) -> Shipment {
    let job_number = match index % 3 {
        0 => None,
        1 => Some(String::new()),
        _ => Some(format!("J{}", index % 7)),
    };
    Shipment {
        shipment_id: ShipmentId::new(),
        vessel_name: Some(VESSELS[index % VESSELS.len()].to_string()),
        job_number,
        pod: Some(if index % 2 == 0 { "JEA" } else { "DXB" }.to_string()),
        vessel_id: if index % 5 == 0 { Some(VesselId::new()) } else { None },
        created_at: OffsetDateTime::UNIX_EPOCH,
        updated_at: OffsetDateTime::UNIX_EPOCH,
    }
}

fn bench_grouping(c: &mut Criterion) {
    let shipments = (0..10_000).map(mk_shipment).collect::<Vec<_>>();
    c.bench_function("group_by_vessel_key_10k", |b| {
        b.iter(|| group_by_vessel_key(&shipments));
    });
}

criterion_group!(benches, bench_grouping);
criterion_main!(benches);
