//! Sub-device discovery and context creation against a fake kernel

mod common;

use std::sync::Arc;

use common::{engine, sub_device, FakeIoControl};
use oa_metrics::kernel::{EngineInfo, KernelInterface, OaUnit};
use oa_metrics::shared::{EngineClass, Generation, MetricsConfig, StatusCode};
use oa_metrics::sub_device::{AcceptanceMode, TopologyState};
use oa_metrics::{traits_for, HostAllocator, MetricsLibrary, SubDeviceClientData, SubDeviceTopology};

fn topology(io: &FakeIoControl, client: Option<SubDeviceClientData>, config: &MetricsConfig) -> SubDeviceTopology {
    let generation = Generation::from_chipset(io.chipset_id).unwrap();
    let mut topology = SubDeviceTopology::new(client);
    topology
        .initialize(io, traits_for(generation), config)
        .unwrap();
    topology
}

fn library(io: FakeIoControl, config: MetricsConfig) -> MetricsLibrary {
    MetricsLibrary::open(
        1,
        0,
        Arc::new(io),
        Arc::new(HostAllocator::default()),
        config,
    )
    .unwrap()
}

#[test]
fn test_single_device_without_client_data() {
    let io = FakeIoControl::new(Generation::Gen12);
    let topology = topology(&io, None, &MetricsConfig::default());

    assert_eq!(topology.state(), TopologyState::Enabled);
    assert_eq!(topology.acceptance_mode(), Some(AcceptanceMode::NoClientData));
    // Copy engines never run queries
    assert_eq!(
        topology.engines(),
        &[
            engine(EngineClass::Render, 0, 0),
            engine(EngineClass::Compute, 0, 0)
        ]
    );
    assert_eq!(
        topology.primary_engine(),
        Some(engine(EngineClass::Render, 0, 0))
    );
}

#[test]
fn test_unexpected_engine_classes_are_skipped() {
    let mut io = FakeIoControl::new(Generation::Gen12);
    io.engines.push(engine(EngineClass::Video, 0, 0));
    io.engines.push(engine(EngineClass::Other(9), 0, 0));

    let topology = topology(&io, None, &MetricsConfig::default());
    assert!(topology.is_enabled());
    assert_eq!(topology.engines().len(), 2);
}

#[test]
fn test_client_data_required() {
    let io = FakeIoControl::new(Generation::Gen12);
    let config = MetricsConfig {
        require_client_data: true,
        ..Default::default()
    };
    let topology = topology(&io, None, &config);
    assert_eq!(topology.state(), TopologyState::Disabled);
}

#[test]
fn test_engines_grouped_by_local_memory() {
    let mut io = FakeIoControl::with_tiles(Generation::XeHp, 2);
    io.sub_device_supported = true;
    let config = MetricsConfig::default();

    let first = topology(&io, Some(sub_device(0, 2)), &config);
    assert_eq!(first.acceptance_mode(), Some(AcceptanceMode::FirstSubDevice));
    assert_eq!(first.sub_device_count(), 2);
    assert_eq!(first.engines(), &[engine(EngineClass::Compute, 0, 0)]);

    let second = topology(&io, Some(sub_device(1, 2)), &config);
    assert_eq!(second.acceptance_mode(), Some(AcceptanceMode::OtherSubDevice));
    assert_eq!(second.engines(), &[engine(EngineClass::Compute, 1, 1)]);
}

#[test]
fn test_other_sub_device_needs_support() {
    let io = FakeIoControl::with_tiles(Generation::XeHp, 2);
    let second = topology(&io, Some(sub_device(1, 2)), &MetricsConfig::default());
    assert_eq!(second.state(), TopologyState::Disabled);

    // Xe2 hardware handles later sub-devices without kernel help
    let io = FakeIoControl::with_tiles(Generation::Xe2Hpg, 2);
    let second = topology(&io, Some(sub_device(1, 2)), &MetricsConfig::default());
    assert!(second.is_enabled());
    assert_eq!(second.engines(), &[engine(EngineClass::Compute, 1, 1)]);
}

#[test]
fn test_root_device_spanning_tiles() {
    let io = FakeIoControl::with_tiles(Generation::XeHp, 2);
    let root = SubDeviceClientData {
        is_sub_device: false,
        sub_device_index: 0,
        sub_device_count: 2,
    };

    let refused = topology(&io, Some(root), &MetricsConfig::default());
    assert_eq!(refused.state(), TopologyState::Disabled);

    let config = MetricsConfig {
        allow_implicit_scaling: true,
        ..Default::default()
    };
    let scaled = topology(&io, Some(root), &config);
    assert_eq!(scaled.acceptance_mode(), Some(AcceptanceMode::RootImplicitScaling));
    assert_eq!(scaled.engines(), &[engine(EngineClass::Compute, 0, 0)]);
}

#[test]
fn test_engines_from_oa_units() {
    let mut io = FakeIoControl::new(Generation::Xe2Hpg);
    io.oa_units = Some(vec![
        OaUnit {
            id: 0,
            gt_id: 0,
            engines: vec![engine(EngineClass::Render, 0, 0), engine(EngineClass::Copy, 0, 0)],
        },
        OaUnit {
            id: 1,
            gt_id: 0,
            engines: vec![engine(EngineClass::Video, 0, 0)],
        },
        OaUnit {
            id: 2,
            gt_id: 1,
            engines: vec![engine(EngineClass::Compute, 0, 1)],
        },
    ]);

    let first = topology(&io, Some(sub_device(0, 2)), &MetricsConfig::default());
    // Video engines are unexpected and dropped
    assert_eq!(first.engines(), &[engine(EngineClass::Render, 0, 0)]);
    assert_eq!(first.sub_device_count(), 2);

    let second = topology(&io, Some(sub_device(1, 2)), &MetricsConfig::default());
    assert_eq!(second.engines(), &[engine(EngineClass::Compute, 0, 1)]);
}

#[test]
fn test_sub_device_without_engines_is_disabled() {
    let mut io = FakeIoControl::with_tiles(Generation::XeHp, 2);
    io.sub_device_supported = true;

    // Client claims a third tile the kernel does not know about
    let topology = topology(&io, Some(sub_device(2, 3)), &MetricsConfig::default());
    assert_eq!(topology.state(), TopologyState::Disabled);
    assert!(topology.engines().is_empty());
}

#[test]
fn test_kernel_interface_reports_generation() {
    let io = Arc::new(FakeIoControl::new(Generation::XeHpg));
    let kernel = KernelInterface::initialize(io, None, &MetricsConfig::default()).unwrap();

    assert_eq!(kernel.generation(), Generation::XeHpg);
    assert_eq!(kernel.oa_frequency(), common::OA_FREQUENCY);
    assert!(kernel.topology().is_enabled());
}

#[test]
fn test_context_creation_failures() {
    let mut unknown = FakeIoControl::new(Generation::Gen9);
    unknown.chipset_id = 0x1234;
    assert_eq!(
        library(unknown, MetricsConfig::default()).context_create(None).err(),
        Some(StatusCode::UnknownGen)
    );

    let mut no_frequency = FakeIoControl::new(Generation::Gen9);
    no_frequency.oa_frequency = 0;
    assert_eq!(
        library(no_frequency, MetricsConfig::default()).context_create(None).err(),
        Some(StatusCode::Failed)
    );

    let mut no_stream = FakeIoControl::new(Generation::Gen12);
    no_stream.fail_open_stream = true;
    assert_eq!(
        library(no_stream, MetricsConfig::default()).context_create(None).err(),
        Some(StatusCode::Failed)
    );

    // A stream that cannot open is fine when mapping is optional
    let mut no_stream = FakeIoControl::new(Generation::Gen12);
    no_stream.fail_open_stream = true;
    let config = MetricsConfig {
        oa_buffer_mapping_required: false,
        ..Default::default()
    };
    assert!(library(no_stream, config).context_create(None).is_ok());

    let tiles = FakeIoControl::with_tiles(Generation::XeHp, 2);
    assert_eq!(
        library(tiles, MetricsConfig::default())
            .context_create(Some(sub_device(1, 2)))
            .err(),
        Some(StatusCode::Failed)
    );
}

#[test]
fn test_engine_display() {
    let info = EngineInfo {
        class: EngineClass::Compute,
        instance: 1,
        gt_id: 0,
    };
    assert_eq!(info.to_string(), "Compute:1 (gt 0)");
}
