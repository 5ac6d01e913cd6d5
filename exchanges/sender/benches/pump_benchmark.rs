use criterion::{
    BenchmarkId, Criterion, Throughput, criterion_group, criterion_main,
};
use std::sync::{Arc, Mutex};

use aerodrop_entities::{FileData, SourceFile};
use aerodropx_common::{
    channel::{Channel, InboundFrame, Rendezvous, memory::MemoryBroker},
    config::TransferConfig,
    frames::ControlFrame,
};
use aerodropx_sender::{ShareFilesRequest, share_files};

struct BenchFileData {
    data: Vec<u8>,
    position: Mutex<usize>,
}

impl BenchFileData {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            position: Mutex::new(0),
        }
    }
}

impl FileData for BenchFileData {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_chunk(&self, size: u64) -> Vec<u8> {
        let mut pos = self.position.lock().unwrap();
        let start = *pos;
        let end = (start + size as usize).min(self.data.len());
        *pos = end;
        self.data[start..end].to_vec()
    }

    fn seek(&self, offset: u64) -> std::io::Result<()> {
        *self.position.lock().unwrap() =
            (offset as usize).min(self.data.len());
        Ok(())
    }
}

fn generate_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(137) ^ i.wrapping_mul(7)) as u8)
        .collect()
}

/// One full share-and-drain cycle over the loopback broker.
async fn transfer_once(data: Vec<u8>, config: TransferConfig) {
    let broker = Arc::new(MemoryBroker::new());
    let bubble = share_files(
        ShareFilesRequest {
            files: vec![SourceFile {
                path: "bench.bin".to_string(),
                mime: String::new(),
                modified_at: 1_700_000_000_000,
                data: Arc::new(BenchFileData::new(data)),
            }],
            config: Some(config),
            code: Some("0042".to_string()),
            ttl: None,
            hooks: None,
        },
        broker.clone(),
    )
    .await
    .unwrap();

    let guest = broker.dial("0042").await.unwrap();
    match guest.recv().await {
        Some(InboundFrame::Control(ControlFrame::Manifest(_))) => {}
        other => panic!("expected manifest, got {other:?}"),
    }
    guest.send_control(ControlFrame::Accept).unwrap();
    loop {
        match guest.recv().await {
            Some(InboundFrame::Control(ControlFrame::AllComplete)) | None => {
                break;
            }
            _ => {}
        }
    }
    drop(bubble);
}

fn bench_transfer_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("transfer_throughput");

    for (label, size) in
        [("1MB", 1 << 20), ("8MB", 8 << 20), ("32MB", 32 << 20)]
    {
        let data = generate_data(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::new("lan_config", label),
            &data,
            |b, data| {
                b.iter(|| {
                    rt.block_on(transfer_once(
                        data.clone(),
                        TransferConfig::lan(),
                    ))
                });
            },
        );
        group.bench_with_input(
            BenchmarkId::new("wan_config", label),
            &data,
            |b, data| {
                b.iter(|| {
                    rt.block_on(transfer_once(
                        data.clone(),
                        TransferConfig::wan(),
                    ))
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_transfer_throughput);
criterion_main!(benches);
