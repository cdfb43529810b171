use std::sync::Arc;

use nexar_ipc::{Communicator, Device, Element, IpcConfig, ReduceOp};

/// Run `f` on every rank of a local group of `world_size` devices.
/// Keeps all communicators alive until every task completes.
pub async fn run_collective<F, Fut>(world_size: u32, config: IpcConfig, f: F)
where
    F: Fn(Arc<Communicator>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let devices = (0..world_size).map(Device::new).collect();
    run_on_devices(devices, config, f).await;
}

/// Like [`run_collective`], with one rank per entry of `devices`.
pub async fn run_on_devices<F, Fut>(devices: Vec<Device>, config: IpcConfig, f: F)
where
    F: Fn(Arc<Communicator>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let comms = Communicator::bootstrap_local_on(devices, config)
        .await
        .unwrap();
    let comms: Vec<Arc<Communicator>> = comms.into_iter().map(Arc::new).collect();

    let f = Arc::new(f);
    let mut handles = Vec::new();
    for c in &comms {
        let c = Arc::clone(c);
        let f = Arc::clone(&f);
        handles.push(tokio::spawn(async move { f(c).await }));
    }
    for h in handles {
        h.await.unwrap();
    }
}

/// Config that sends every multi-rank all-reduce down the bulk path.
pub fn bulk_only() -> IpcConfig {
    IpcConfig {
        small_msg_bytes: 0,
        ..IpcConfig::default()
    }
}

/// All-reduce `values` out of place and return the result.
pub async fn all_reduce_values<T: Element>(comm: &Communicator, values: &[T]) -> Vec<T> {
    let send = comm.device().alloc_from(values).unwrap();
    let recv = comm
        .device()
        .alloc(std::mem::size_of_val(values))
        .unwrap();
    let stream = comm.create_stream().unwrap();
    comm.all_reduce(&send, &recv, values.len(), T::DTYPE, ReduceOp::Sum, &stream)
        .await
        .unwrap();
    stream.synchronize().await.unwrap();
    recv.to_host(values.len()).unwrap()
}

/// Per-rank test pattern: small integers so every sum is exact.
pub fn pattern(rank: u32, i: usize) -> i32 {
    (i % 7) as i32 + rank as i32 + 1
}

/// Sum of [`pattern`] over all ranks.
pub fn pattern_sum(world_size: u32, i: usize) -> i32 {
    (0..world_size).map(|r| pattern(r, i)).sum()
}

