use nexar_ipc::{DataType, Device, IpcConfig, IpcError, ReduceOp, ResultCode};

use super::helpers::{bulk_only, run_collective, run_on_devices};

#[tokio::test(flavor = "multi_thread")]
async fn test_unsupported_dtype() {
    run_collective(2, IpcConfig::default(), |comm| async move {
        let buf = comm.device().alloc(64).unwrap();
        let stream = comm.create_stream().unwrap();
        for dtype in [DataType::BF16, DataType::F64, DataType::U8, DataType::I64] {
            let res = comm
                .all_reduce(&buf, &buf, 4, dtype, ReduceOp::Sum, &stream)
                .await;
            assert!(
                matches!(res, Err(IpcError::UnsupportedDType { .. })),
                "{dtype} should be rejected"
            );
            assert_eq!(ResultCode::from(&res), ResultCode::InvalidArgument);
        }
        assert_eq!(comm.cached_channel_sets().await, 0);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unsupported_op() {
    run_collective(2, IpcConfig::default(), |comm| async move {
        let buf = comm.device().alloc(64).unwrap();
        let stream = comm.create_stream().unwrap();
        for op in [ReduceOp::Prod, ReduceOp::Min, ReduceOp::Max] {
            let res = comm
                .all_reduce(&buf, &buf, 4, DataType::F32, op, &stream)
                .await;
            assert!(matches!(res, Err(IpcError::UnsupportedOp { .. })), "{op}");
            assert_eq!(ResultCode::from(&res), ResultCode::InternalError);
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_zero_count() {
    run_collective(2, IpcConfig::default(), |comm| async move {
        let buf = comm.device().alloc(64).unwrap();
        let stream = comm.create_stream().unwrap();
        let res = comm
            .all_reduce(&buf, &buf, 0, DataType::F32, ReduceOp::Sum, &stream)
            .await;
        assert!(matches!(res, Err(IpcError::InvalidArgument(_))));
        let res = comm.all_gather(&buf, &buf, 0, DataType::U8, &stream).await;
        assert!(matches!(res, Err(IpcError::InvalidArgument(_))));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_count_overflowing_bytes() {
    for world in [1, 2] {
        run_collective(world, IpcConfig::default(), |comm| async move {
            let buf = comm.device().alloc(64).unwrap();
            let stream = comm.create_stream().unwrap();
            let res = comm
                .all_reduce(&buf, &buf, usize::MAX / 2 + 2, DataType::F32, ReduceOp::Sum, &stream)
                .await;
            assert!(matches!(res, Err(IpcError::InvalidArgument(_))), "got {res:?}");
            assert_eq!(ResultCode::from(&res), ResultCode::InvalidArgument);

            // Fits for one rank, overflows once multiplied by the world size.
            let res = comm
                .all_gather(&buf, &buf, usize::MAX / 2 + 1, DataType::U8, &stream)
                .await;
            if comm.world_size() > 1 {
                assert!(matches!(res, Err(IpcError::InvalidArgument(_))), "got {res:?}");
            } else {
                assert!(matches!(res, Err(IpcError::BufferTooSmall { .. })), "got {res:?}");
            }
            stream.synchronize().await.unwrap();
            assert_eq!(buf.read_bytes(0, 64).unwrap(), vec![0; 64]);
        })
        .await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_buffer_too_small() {
    run_collective(2, IpcConfig::default(), |comm| async move {
        let small = comm.device().alloc(8).unwrap();
        let big = comm.device().alloc(64).unwrap();
        let stream = comm.create_stream().unwrap();

        let res = comm
            .all_reduce(&small, &big, 4, DataType::I32, ReduceOp::Sum, &stream)
            .await;
        assert!(matches!(res, Err(IpcError::BufferTooSmall { needed: 16, .. })));

        // The gather result must hold every rank's contribution.
        let res = comm.all_gather(&small, &small, 8, DataType::U8, &stream).await;
        assert!(matches!(
            res,
            Err(IpcError::BufferTooSmall {
                needed: 16,
                actual: 8,
                ..
            })
        ));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_device_mismatch() {
    run_collective(2, IpcConfig::default(), |comm| async move {
        let foreign = Device::new(comm.device().ordinal() + 10).alloc(64).unwrap();
        let local = comm.device().alloc(64).unwrap();
        let stream = comm.create_stream().unwrap();
        let res = comm
            .all_reduce(&foreign, &local, 4, DataType::F32, ReduceOp::Sum, &stream)
            .await;
        assert!(matches!(res, Err(IpcError::DeviceMismatch { .. })));

        let other_stream = Device::new(comm.device().ordinal() + 10)
            .create_stream()
            .unwrap();
        let res = comm
            .all_gather(&local, &local, 4, DataType::U8, &other_stream)
            .await;
        assert!(matches!(res, Err(IpcError::DeviceMismatch { .. })));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bulk_across_hosts_is_unimplemented() {
    let devices = vec![
        Device::new(0).with_host("node-a"),
        Device::new(1).with_host("node-b"),
    ];
    run_on_devices(devices, bulk_only(), |comm| async move {
        let buf = comm.device().alloc(64).unwrap();
        let stream = comm.create_stream().unwrap();
        let res = comm
            .all_reduce(&buf, &buf, 16, DataType::F32, ReduceOp::Sum, &stream)
            .await;
        assert!(matches!(res, Err(IpcError::Unimplemented { .. })));
        assert_eq!(ResultCode::from(&res), ResultCode::InternalError);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unimplemented_surface() {
    run_collective(2, IpcConfig::default(), |comm| async move {
        let buf = comm.device().alloc(64).unwrap();
        let stream = comm.create_stream().unwrap();
        let peer = 1 - comm.rank();

        let results = [
            comm.send(&buf, 4, DataType::F32, peer, &stream).await,
            comm.recv(&buf, 4, DataType::F32, peer, &stream).await,
            comm.broadcast(&buf, &buf, 4, DataType::F32, 0, &stream).await,
            comm.reduce(&buf, &buf, 4, DataType::F32, ReduceOp::Sum, 0, &stream)
                .await,
            comm.reduce_scatter(&buf, &buf, 2, DataType::F32, ReduceOp::Sum, &stream)
                .await,
        ];
        for res in &results {
            assert!(matches!(res, Err(IpcError::Unimplemented { .. })));
            assert_eq!(ResultCode::from(res), ResultCode::InternalError);
        }
        assert!(matches!(
            comm.split(0, comm.rank() as i32).await,
            Err(IpcError::Unimplemented { .. })
        ));
        assert!(comm.create_custom_reduce_op(DataType::F32).is_err());
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_group_calls_are_noops() {
    run_collective(2, IpcConfig::default(), |comm| async move {
        let rank = comm.rank();
        comm.group_start().unwrap();
        let values = vec![rank as f32 + 1.0; 8];
        let out = super::helpers::all_reduce_values(&comm, &values).await;
        comm.group_end().unwrap();
        assert_eq!(out, vec![3.0; 8]);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_init_rank_with_unique_id() {
    let id = nexar_ipc::get_unique_id();
    let mut handles = Vec::new();
    for rank in 0..3u32 {
        handles.push(tokio::spawn(async move {
            let comm = nexar_ipc::Communicator::init_rank(
                3,
                &id,
                rank,
                Device::new(rank),
                IpcConfig::default(),
            )
            .await
            .unwrap();
            assert_eq!(comm.rank(), rank);
            assert_eq!(comm.world_size(), 3);
            assert_eq!(comm.n_ranks_per_node(), 3);
            assert!(comm.is_single_node());
            let out = super::helpers::all_reduce_values(&comm, &[rank as i32; 10]).await;
            assert_eq!(out, vec![3; 10]);
            comm.destroy().await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_zero_scratch_is_rejected() {
    let config = IpcConfig {
        scratch_bytes: 0,
        ..IpcConfig::default()
    };
    let err = nexar_ipc::Communicator::bootstrap_local(2, config)
        .await
        .unwrap_err();
    assert!(matches!(err, IpcError::InvalidArgument(_)));
}
