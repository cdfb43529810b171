use nexar_ipc::{DataType, Device, IpcConfig, IpcError, LaunchConfig};

use super::helpers::run_collective;

async fn check_u8(world_size: u32, per_rank: usize, config: IpcConfig) {
    run_collective(world_size, config, move |comm| async move {
        let rank = comm.rank();
        let contribution: Vec<u8> = (0..per_rank).map(|i| (rank as usize * 31 + i) as u8).collect();
        let send = comm.device().alloc_from(&contribution).unwrap();
        let recv = comm.device().alloc(per_rank * world_size as usize).unwrap();
        let stream = comm.create_stream().unwrap();
        comm.all_gather(&send, &recv, per_rank, DataType::U8, &stream)
            .await
            .unwrap();
        stream.synchronize().await.unwrap();

        let expected: Vec<u8> = (0..world_size as usize)
            .flat_map(|r| (0..per_rank).map(move |i| (r * 31 + i) as u8))
            .collect();
        assert_eq!(
            recv.read_bytes(0, expected.len()).unwrap(),
            expected,
            "rank {rank} allgather of {per_rank} bytes failed"
        );
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_allgather_concatenates_in_rank_order() {
    for world in [1, 2, 4, 8] {
        check_u8(world, 64, IpcConfig::default()).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_allgather_odd_sizes() {
    for per_rank in [1, 3, 13, 4097] {
        check_u8(3, per_rank, IpcConfig::default()).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_allgather_large_units() {
    // Big enough that every thread moves 64-byte units.
    check_u8(4, 600_000, IpcConfig::default()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_allgather_small_grid() {
    let config = IpcConfig {
        bulk_launch: Some(LaunchConfig::new(1, 64)),
        ..IpcConfig::default()
    };
    check_u8(5, 1000, config).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_allgather_f32() {
    run_collective(4, IpcConfig::default(), |comm| async move {
        let rank = comm.rank();
        let send = comm
            .device()
            .alloc_from(&[rank as f32, rank as f32 + 0.5])
            .unwrap();
        let recv = comm.device().alloc(8 * 4).unwrap();
        let stream = comm.create_stream().unwrap();
        comm.all_gather(&send, &recv, 2, DataType::F32, &stream)
            .await
            .unwrap();
        stream.synchronize().await.unwrap();
        assert_eq!(
            recv.to_host::<f32>(8).unwrap(),
            vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5, 3.0, 3.5]
        );
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_allgather_repeated_reuses_channels() {
    run_collective(2, IpcConfig::default(), |comm| async move {
        let rank = comm.rank();
        let send = comm.device().alloc(16).unwrap();
        let recv = comm.device().alloc(32).unwrap();
        let stream = comm.create_stream().unwrap();
        for round in 0..3u8 {
            send.write_bytes(0, &[rank as u8 * 10 + round; 16]).unwrap();
            comm.all_gather(&send, &recv, 16, DataType::U8, &stream)
                .await
                .unwrap();
            stream.synchronize().await.unwrap();
            let mut expected = vec![round; 16];
            expected.extend([10 + round; 16]);
            assert_eq!(recv.read_bytes(0, 32).unwrap(), expected);
        }
        assert_eq!(comm.cached_channel_sets().await, 1);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_allgather_across_hosts_is_unimplemented() {
    let devices = vec![
        Device::new(0).with_host("node-a"),
        Device::new(1).with_host("node-b"),
    ];
    super::helpers::run_on_devices(devices, IpcConfig::default(), |comm| async move {
        let send = comm.device().alloc(4).unwrap();
        let recv = comm.device().alloc(8).unwrap();
        let stream = comm.create_stream().unwrap();
        let err = comm
            .all_gather(&send, &recv, 1, DataType::I32, &stream)
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Unimplemented { .. }), "got {err}");
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_allgather_in_place() {
    // The contribution already sits in this rank's slot of the result.
    run_collective(3, IpcConfig::default(), |comm| async move {
        let rank = comm.rank() as usize;
        let buf = comm.device().alloc(3 * 8).unwrap();
        buf.write_bytes(rank * 8, &[rank as u8 + 1; 8]).unwrap();
        let stream = comm.create_stream().unwrap();
        comm.all_gather(&buf, &buf, 8, DataType::U8, &stream)
            .await
            .unwrap();
        stream.synchronize().await.unwrap();
        let expected: Vec<u8> = (1..=3u8).flat_map(|v| [v; 8]).collect();
        assert_eq!(buf.read_bytes(0, 24).unwrap(), expected);
    })
    .await;
}
