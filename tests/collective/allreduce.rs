use half::f16;
use nexar_ipc::{AllReducePath, DataType, Device, IpcConfig, LaunchConfig, ReduceOp};

use super::helpers::{all_reduce_values, bulk_only, pattern, pattern_sum, run_collective, run_on_devices};

const SIZES: [usize; 3] = [1, 5, 4097];

async fn check_i32(world_size: u32, config: IpcConfig) {
    run_collective(world_size, config, move |comm| async move {
        let rank = comm.rank();
        for n in SIZES {
            let values: Vec<i32> = (0..n).map(|i| pattern(rank, i)).collect();
            let out = all_reduce_values(&comm, &values).await;
            let expected: Vec<i32> = (0..n).map(|i| pattern_sum(world_size, i)).collect();
            assert_eq!(out, expected, "rank {rank} n={n} i32 allreduce failed");
        }
    })
    .await;
}

async fn check_f32(world_size: u32, config: IpcConfig) {
    run_collective(world_size, config, move |comm| async move {
        let rank = comm.rank();
        for n in SIZES {
            let values: Vec<f32> = (0..n).map(|i| pattern(rank, i) as f32 * 0.5).collect();
            let out = all_reduce_values(&comm, &values).await;
            let expected: Vec<f32> = (0..n).map(|i| pattern_sum(world_size, i) as f32 * 0.5).collect();
            assert_eq!(out, expected, "rank {rank} n={n} f32 allreduce failed");
        }
    })
    .await;
}

async fn check_f16(world_size: u32, config: IpcConfig) {
    run_collective(world_size, config, move |comm| async move {
        let rank = comm.rank();
        for n in SIZES {
            let values: Vec<f16> = (0..n).map(|i| f16::from_f32(pattern(rank, i) as f32)).collect();
            let out = all_reduce_values(&comm, &values).await;
            let expected: Vec<f16> = (0..n)
                .map(|i| f16::from_f32(pattern_sum(world_size, i) as f32))
                .collect();
            assert_eq!(out, expected, "rank {rank} n={n} f16 allreduce failed");
        }
    })
    .await;
}

// ============================================================================
// Packet path
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_packet_allreduce_i32() {
    for world in [2, 4, 8] {
        check_i32(world, IpcConfig::default()).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_packet_allreduce_f32() {
    for world in [2, 4, 8] {
        check_f32(world, IpcConfig::default()).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_packet_allreduce_f16() {
    for world in [2, 4, 8] {
        check_f16(world, IpcConfig::default()).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_packet_allreduce_rocm_geometry() {
    let config = IpcConfig {
        platform: nexar_ipc::Platform::Rocm,
        ..IpcConfig::default()
    };
    check_i32(4, config).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_packet_allreduce_uses_packet_path() {
    run_collective(4, IpcConfig::default(), |comm| async move {
        assert_eq!(comm.all_reduce_path(4097 * 4), AllReducePath::Packet);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_packet_generation_advances_per_call() {
    run_collective(2, IpcConfig::default(), |comm| async move {
        let rank = comm.rank();
        assert_eq!(comm.packet_generation(), 0);
        for call in 1..=3u64 {
            let values = vec![rank as i32 + call as i32; 33];
            let out = all_reduce_values(&comm, &values).await;
            assert_eq!(out, vec![1 + 2 * call as i32; 33], "rank {rank} call {call}");
            assert_eq!(comm.packet_generation(), call);
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_packet_back_to_back_on_one_stream() {
    // Consecutive calls without a synchronize in between alternate scratch
    // halves; the stream keeps them in order.
    run_collective(4, IpcConfig::default(), |comm| async move {
        let rank = comm.rank();
        let stream = comm.create_stream().unwrap();
        let a = comm.device().alloc_from(&vec![rank as i32; 100]).unwrap();
        let b = comm.device().alloc_from(&vec![10 * rank as i32; 100]).unwrap();
        for _ in 0..4 {
            comm.all_reduce(&a, &a, 100, DataType::I32, ReduceOp::Sum, &stream)
                .await
                .unwrap();
            comm.all_reduce(&b, &b, 100, DataType::I32, ReduceOp::Sum, &stream)
                .await
                .unwrap();
        }
        stream.synchronize().await.unwrap();
        // The first call sums the ranks to 6; each later one multiplies by 4.
        assert_eq!(a.to_host::<i32>(100).unwrap(), vec![6 * 64; 100]);
        assert_eq!(b.to_host::<i32>(100).unwrap(), vec![60 * 64; 100]);
        assert_eq!(comm.packet_generation(), 8);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_packet_in_place() {
    run_collective(4, IpcConfig::default(), |comm| async move {
        let rank = comm.rank();
        let n = 4097;
        let values: Vec<f32> = (0..n).map(|i| pattern(rank, i) as f32).collect();
        let buf = comm.device().alloc_from(&values).unwrap();
        let stream = comm.create_stream().unwrap();
        comm.all_reduce(&buf, &buf, n, DataType::F32, ReduceOp::Sum, &stream)
            .await
            .unwrap();
        stream.synchronize().await.unwrap();
        let expected: Vec<f32> = (0..n).map(|i| pattern_sum(4, i) as f32).collect();
        assert_eq!(buf.to_host::<f32>(n).unwrap(), expected);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_packet_leaves_tail_bytes_alone() {
    // Three f16 elements occupy one and a half lanes; the upper half of the
    // second lane belongs to the caller.
    run_collective(2, IpcConfig::default(), |comm| async move {
        let recv = comm.device().alloc(8).unwrap();
        recv.write_bytes(6, &[0xAA, 0xBB]).unwrap();
        let values = [f16::ONE, f16::from_f32(2.0), f16::from_f32(3.0)];
        let send = comm.device().alloc_from(&values).unwrap();
        let stream = comm.create_stream().unwrap();
        comm.all_reduce(&send, &recv, 3, DataType::F16, ReduceOp::Sum, &stream)
            .await
            .unwrap();
        stream.synchronize().await.unwrap();
        let out = recv.to_host::<f16>(3).unwrap();
        assert_eq!(out, vec![f16::from_f32(2.0), f16::from_f32(4.0), f16::from_f32(6.0)]);
        assert_eq!(recv.read_bytes(6, 2).unwrap(), vec![0xAA, 0xBB]);
    })
    .await;
}

// ============================================================================
// Bulk path
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_bulk_allreduce_i32() {
    for world in [2, 4, 8] {
        check_i32(world, bulk_only()).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bulk_allreduce_f32() {
    for world in [2, 4, 8] {
        check_f32(world, bulk_only()).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bulk_allreduce_f16() {
    for world in [2, 4, 8] {
        check_f16(world, bulk_only()).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bulk_allreduce_small_grid() {
    let config = IpcConfig {
        bulk_launch: Some(LaunchConfig::new(2, 64)),
        ..bulk_only()
    };
    check_i32(3, config).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bulk_allreduce_large_message() {
    // Past the default threshold, so the default config takes the bulk path.
    let n = (1 << 20) / 4 + 3;
    run_collective(2, IpcConfig::default(), move |comm| async move {
        let rank = comm.rank();
        assert_eq!(comm.all_reduce_path(n * 4), AllReducePath::Bulk);
        let values: Vec<i32> = (0..n).map(|i| pattern(rank, i)).collect();
        let out = all_reduce_values(&comm, &values).await;
        for (i, v) in out.iter().enumerate() {
            assert_eq!(*v, pattern_sum(2, i), "rank {rank} element {i}");
        }
        assert_eq!(comm.packet_generation(), 0);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bulk_in_place() {
    run_collective(4, bulk_only(), |comm| async move {
        let rank = comm.rank();
        let n = 4097;
        let values: Vec<i32> = (0..n).map(|i| pattern(rank, i)).collect();
        let buf = comm.device().alloc_from(&values).unwrap();
        let stream = comm.create_stream().unwrap();
        comm.all_reduce(&buf, &buf, n, DataType::I32, ReduceOp::Sum, &stream)
            .await
            .unwrap();
        stream.synchronize().await.unwrap();
        let expected: Vec<i32> = (0..n).map(|i| pattern_sum(4, i)).collect();
        assert_eq!(buf.to_host::<i32>(n).unwrap(), expected);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bulk_when_scratch_is_too_small() {
    let config = IpcConfig {
        scratch_bytes: 4096,
        ..IpcConfig::default()
    };
    run_collective(2, config, |comm| async move {
        let rank = comm.rank();
        assert_eq!(comm.all_reduce_path(4096), AllReducePath::Bulk);
        let values = vec![rank as i32 + 1; 1024];
        let out = all_reduce_values(&comm, &values).await;
        assert_eq!(out, vec![3; 1024]);
    })
    .await;
}

// ============================================================================
// Selection and caching
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_threshold_is_inclusive() {
    run_collective(4, IpcConfig::default(), |comm| async move {
        assert_eq!(comm.all_reduce_path(1 << 20), AllReducePath::Packet);
        assert_eq!(comm.all_reduce_path((1 << 20) + 1), AllReducePath::Bulk);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_threshold_boundary_results() {
    // 2^19 f16 elements fill the threshold exactly; one more crosses it.
    run_collective(4, IpcConfig::default(), |comm| async move {
        let rank = comm.rank();
        for (n, path) in [(1 << 19, AllReducePath::Packet), ((1 << 19) + 1, AllReducePath::Bulk)] {
            assert_eq!(comm.all_reduce_path(n * 2), path);
            let values: Vec<f16> = (0..n).map(|i| f16::from_f32(pattern(rank, i) as f32)).collect();
            let out = all_reduce_values(&comm, &values).await;
            for (i, v) in out.iter().enumerate() {
                assert_eq!(
                    *v,
                    f16::from_f32(pattern_sum(4, i) as f32),
                    "rank {rank} n={n} element {i}"
                );
            }
        }
        assert_eq!(comm.packet_generation(), 1);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_rank_copies() {
    run_collective(1, IpcConfig::default(), |comm| async move {
        assert_eq!(comm.all_reduce_path(16), AllReducePath::Copy);
        let values: Vec<i32> = (0..4097).collect();
        let out = all_reduce_values(&comm, &values).await;
        assert_eq!(out, values);
        assert_eq!(comm.cached_channel_sets().await, 0);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_repeated_calls_reuse_channels() {
    run_collective(4, bulk_only(), |comm| async move {
        let rank = comm.rank();
        let send = comm.device().alloc_from(&vec![rank as i32; 256]).unwrap();
        let recv = comm.device().alloc(1024).unwrap();
        let stream = comm.create_stream().unwrap();
        for _ in 0..3 {
            comm.all_reduce(&send, &recv, 256, DataType::I32, ReduceOp::Sum, &stream)
                .await
                .unwrap();
            stream.synchronize().await.unwrap();
            assert_eq!(comm.cached_channel_sets().await, 1);
        }
        assert_eq!(recv.to_host::<i32>(256).unwrap(), vec![6; 256]);

        // A different byte count is a different channel set.
        comm.all_reduce(&send, &recv, 128, DataType::I32, ReduceOp::Sum, &stream)
            .await
            .unwrap();
        stream.synchronize().await.unwrap();
        assert_eq!(comm.cached_channel_sets().await, 2);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fresh_buffers_get_fresh_channels() {
    run_collective(2, bulk_only(), |comm| async move {
        for round in 1..=2 {
            let out = all_reduce_values(&comm, &[1i32; 64]).await;
            assert_eq!(out, vec![2; 64]);
            assert_eq!(comm.cached_channel_sets().await, round);
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_multi_host_packet_is_noop() {
    let devices = vec![
        Device::new(0).with_host("node-a"),
        Device::new(1).with_host("node-b"),
    ];
    run_on_devices(devices, IpcConfig::default(), |comm| async move {
        assert!(!comm.is_single_node());
        assert_eq!(comm.n_ranks_per_node(), 1);
        assert_eq!(comm.all_reduce_path(64), AllReducePath::Packet);

        let send = comm.device().alloc_from(&[5i32; 16]).unwrap();
        let recv = comm.device().alloc_from(&[-1i32; 16]).unwrap();
        let stream = comm.create_stream().unwrap();
        comm.all_reduce(&send, &recv, 16, DataType::I32, ReduceOp::Sum, &stream)
            .await
            .unwrap();
        stream.synchronize().await.unwrap();
        assert_eq!(recv.to_host::<i32>(16).unwrap(), vec![-1; 16]);
        assert_eq!(comm.packet_generation(), 0);
    })
    .await;
}
