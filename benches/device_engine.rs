//! Benchmarks for the per-pass hot paths
//!
//! Approval evaluation, snapshot building and detection fusion run once per
//! device per reconcile.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use gpu_fleet_operator::config::ManagedNodesSettings;
use gpu_fleet_operator::crd::{GPUDeviceHardware, GPUDeviceHealth};
use gpu_fleet_operator::hardware::approval::{DeviceApprovalMode, DeviceApprovalPolicy};
use gpu_fleet_operator::hardware::detection::{
    apply_detection_hardware, DetectionEntry, DetectionMig, DetectionPci,
};
use gpu_fleet_operator::hardware::snapshot::{build_node_snapshot, NodeInfo, DEVICE_LABEL_PREFIX};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use std::collections::BTreeMap;

fn node_with_devices(count: u32) -> NodeInfo {
    let mut labels = BTreeMap::new();
    for index in 0..count {
        for (field, value) in [
            ("vendor", "10de"),
            ("device", "20b5"),
            ("class", "0302"),
            ("pci", "0000:3b:00.0"),
            ("memory-mib", "81920"),
            ("precision", "fp64_fp32_tf32_fp16_bf16_int8"),
            ("mig.capable", "true"),
            ("mig.profiles", "mig-1g.10gb_mig-2g.20gb_mig-3g.40gb_mig-7g.80gb"),
        ] {
            labels.insert(format!("{DEVICE_LABEL_PREFIX}{index}.{field}"), value.to_string());
        }
    }
    NodeInfo {
        name: "bench-node".to_string(),
        uid: "bench-uid".to_string(),
        labels,
        address: None,
    }
}

fn bench_approval(c: &mut Criterion) {
    let mut group = c.benchmark_group("approval");
    group.throughput(Throughput::Elements(1));

    let selector = LabelSelector {
        match_labels: Some(BTreeMap::from([(
            "gpu.billyronks.io/product".to_string(),
            "NVIDIA-A100-PCIE-80GB".to_string(),
        )])),
        match_expressions: Some(vec![LabelSelectorRequirement {
            key: "gpu.billyronks.io/memory-mib".to_string(),
            operator: "In".to_string(),
            values: Some(vec!["40960".to_string(), "81920".to_string()]),
        }]),
    };
    let policy = DeviceApprovalPolicy::new(DeviceApprovalMode::Selector, Some(selector));
    let labels = BTreeMap::from([
        ("gpu.billyronks.io/product".to_string(), "NVIDIA-A100-PCIE-80GB".to_string()),
        ("gpu.billyronks.io/memory-mib".to_string(), "81920".to_string()),
    ]);

    group.bench_function("selector_auto_attach", |b| {
        b.iter(|| policy.auto_attach(black_box(true), black_box(&labels)))
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");
    let settings = ManagedNodesSettings::default();

    for count in [1u32, 8] {
        let node = node_with_devices(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(format!("build_{}_devices", count), |b| {
            b.iter(|| build_node_snapshot(black_box(&node), None, &settings))
        });
    }

    group.finish();
}

fn bench_detection_fusion(c: &mut Criterion) {
    let mut group = c.benchmark_group("detection");
    group.throughput(Throughput::Elements(1));

    let entry = DetectionEntry {
        index: Some(0),
        uuid: "GPU-5f0c9d2e-1b7a-4c55-9e8e-0b4b1d2a7c11".to_string(),
        product: "NVIDIA A100 80GB PCIe".to_string(),
        pci_info: DetectionPci {
            address: "00000000:3B:00.0".to_string(),
            vendor: "0x10DE".to_string(),
            device: "0x20B5".to_string(),
            class: "0x0302".to_string(),
        },
        temperature_c: Some(41),
        power_usage_mw: Some(61_000),
        mig: Some(DetectionMig {
            capable: true,
            mode: "mixed".to_string(),
            profiles_supported: vec!["MIG-1g.10gb".to_string(), "mig-2g.20gb".to_string()],
        }),
        ..Default::default()
    };

    group.bench_function("apply_detection_hardware", |b| {
        b.iter(|| {
            let mut hardware = GPUDeviceHardware::default();
            let mut health = GPUDeviceHealth::default();
            apply_detection_hardware(&mut hardware, &mut health, black_box(&entry));
            hardware
        })
    });

    group.finish();
}

criterion_group!(benches, bench_approval, bench_snapshot, bench_detection_fusion);
criterion_main!(benches);
