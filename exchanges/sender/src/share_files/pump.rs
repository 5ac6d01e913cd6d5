//! The producer loop.
//!
//! Walks the manifest from a seed `(start_index, start_offset)`, slicing
//! each source into chunks under the high/low-watermark discipline: once the
//! channel's buffered amount reaches the high mark, the pump parks until it
//! drains to the low mark. The low mark is non-zero so the pipeline never
//! fully empties between refills.
//!
//! The pump is tagged with the session epoch at launch and checks it after
//! every suspension point; a bumped epoch makes it exit without emitting
//! further frames.

use std::sync::Arc;

use aerodropx_common::{
    channel::Channel, config::TransferConfig, frames::ControlFrame,
};
use anyhow::Context;
use bytes::Bytes;
use tracing::debug;

use super::handler::ShareFilesHandler;

/// Why the pump stopped emitting.
#[derive(Debug)]
pub(crate) enum PumpOutcome {
    /// The manifest was exhausted and `ALL_COMPLETE` was sent.
    Done,
    /// The session epoch moved on; the loop exited quietly.
    Superseded,
}

#[derive(Debug)]
pub(crate) enum PumpError {
    /// The channel refused a send.
    Channel,
    /// The source could not be read.
    Source(anyhow::Error),
}

pub(crate) async fn run_pump<C: Channel>(
    channel: C,
    handler: Arc<ShareFilesHandler>,
    config: TransferConfig,
    start_index: usize,
    start_offset: u64,
    epoch: u64,
) -> Result<PumpOutcome, PumpError> {
    let manifest = handler.manifest().clone();

    for index in start_index..manifest.files.len() {
        let entry = &manifest.files[index];
        let start = if index == start_index { start_offset } else { 0 };

        channel
            .send_control(ControlFrame::FileStart {
                file_index: index,
                path: entry.path.clone(),
                size: entry.size - start,
            })
            .map_err(|_| PumpError::Channel)?;

        let data = handler.file_data(index);
        data.seek(start)
            .with_context(|| format!("seeking {} to offset {start}", entry.path))
            .map_err(PumpError::Source)?;

        let mut offset = start;
        let mut chunks_since_yield = 0u32;
        while offset < entry.size {
            if channel.buffered_amount() >= config.high_watermark {
                channel.drained_to(config.low_watermark).await;
                if handler.epoch() != epoch {
                    return Ok(PumpOutcome::Superseded);
                }
            }

            let want = config.chunk_size.min(entry.size - offset);
            let chunk = data.read_chunk(want);
            if chunk.is_empty() {
                return Err(PumpError::Source(anyhow::anyhow!(
                    "source for {} ended at {offset} of {} bytes",
                    entry.path,
                    entry.size
                )));
            }

            let len = chunk.len() as u64;
            channel
                .send_binary(Bytes::from(chunk))
                .map_err(|_| PumpError::Channel)?;
            offset += len;
            handler.record_sent(
                index,
                &entry.path,
                offset,
                entry.size - offset,
                len,
            );

            chunks_since_yield += 1;
            if chunks_since_yield >= config.yield_every_chunks {
                chunks_since_yield = 0;
                // Let control frames and other tasks interleave.
                tokio::task::yield_now().await;
                if handler.epoch() != epoch {
                    return Ok(PumpOutcome::Superseded);
                }
            }
        }

        if handler.epoch() != epoch {
            return Ok(PumpOutcome::Superseded);
        }
        channel
            .send_control(ControlFrame::FileComplete { file_index: index })
            .map_err(|_| PumpError::Channel)?;
        debug!(path = %entry.path, sent = offset - start, "file complete");
    }

    channel
        .send_control(ControlFrame::AllComplete)
        .map_err(|_| PumpError::Channel)?;
    Ok(PumpOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aerodrop_entities::{FileData, SourceFile};
    use aerodropx_common::{
        channel::{
            ChannelClosed, CloseReason, InboundFrame,
            memory::{self, LinkThrottle, MemoryChannel},
        },
        config::NetworkClass,
        frames::ControlFrame,
        host::noop_hooks,
        manifest::{FileEntry, TransferManifest},
    };
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    struct StubFileData {
        data: Vec<u8>,
        position: Mutex<usize>,
    }

    impl StubFileData {
        fn new(data: Vec<u8>) -> Self {
            Self {
                data,
                position: Mutex::new(0),
            }
        }
    }

    impl FileData for StubFileData {
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

    fn test_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn source(path: &str, data: Vec<u8>) -> SourceFile {
        SourceFile {
            path: path.to_string(),
            mime: String::new(),
            modified_at: 1_700_000_000_000,
            data: Arc::new(StubFileData::new(data)),
        }
    }

    fn handler_for(files: Vec<SourceFile>) -> Arc<ShareFilesHandler> {
        let entries = files
            .iter()
            .map(|f| {
                FileEntry::new(
                    f.path.clone(),
                    f.size(),
                    f.mime.clone(),
                    f.modified_at,
                )
            })
            .collect();
        Arc::new(ShareFilesHandler::new(
            TransferManifest::new(entries, None),
            files,
            None,
            noop_hooks(),
        ))
    }

    fn small_config() -> TransferConfig {
        TransferConfig {
            chunk_size: 1024,
            high_watermark: 8 * 1024,
            low_watermark: 2 * 1024,
            ..TransferConfig::wan()
        }
    }

    async fn collect_frames(channel: &MemoryChannel) -> Vec<InboundFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = channel.recv().await {
            let done = matches!(
                frame,
                InboundFrame::Control(ControlFrame::AllComplete)
            );
            frames.push(frame);
            if done {
                break;
            }
        }
        frames
    }

    #[tokio::test]
    async fn pumps_a_multi_file_manifest_in_order() {
        let (sender, receiver) = memory::pair(NetworkClass::Lan);
        let payload_a = test_data(2500);
        let payload_b = test_data(100);
        let handler = handler_for(vec![
            source("a/1.bin", payload_a.clone()),
            source("a/2.bin", payload_b.clone()),
        ]);

        let pump = tokio::spawn(run_pump(
            sender,
            handler.clone(),
            small_config(),
            0,
            0,
            handler.epoch(),
        ));

        let frames = collect_frames(&receiver).await;
        assert!(matches!(pump.await.unwrap(), Ok(PumpOutcome::Done)));

        // FILE_START(0), 3 chunks, FILE_COMPLETE(0), FILE_START(1), 1 chunk,
        // FILE_COMPLETE(1), ALL_COMPLETE.
        assert!(matches!(
            frames[0],
            InboundFrame::Control(ControlFrame::FileStart {
                file_index: 0,
                size: 2500,
                ..
            })
        ));
        let bytes_a: Vec<u8> = frames[1..4]
            .iter()
            .flat_map(|f| match f {
                InboundFrame::Binary(data) => data.to_vec(),
                _ => panic!("expected binary frame"),
            })
            .collect();
        assert_eq!(bytes_a, payload_a);
        assert!(matches!(
            frames[4],
            InboundFrame::Control(ControlFrame::FileComplete { file_index: 0 })
        ));
        assert!(matches!(
            frames[5],
            InboundFrame::Control(ControlFrame::FileStart {
                file_index: 1,
                size: 100,
                ..
            })
        ));
        match &frames[6] {
            InboundFrame::Binary(data) => assert_eq!(data.to_vec(), payload_b),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(matches!(
            frames[7],
            InboundFrame::Control(ControlFrame::FileComplete { file_index: 1 })
        ));
        assert!(matches!(
            frames[8],
            InboundFrame::Control(ControlFrame::AllComplete)
        ));
    }

    #[tokio::test]
    async fn empty_file_emits_no_binary_frames() {
        let (sender, receiver) = memory::pair(NetworkClass::Lan);
        let handler = handler_for(vec![source("empty.txt", Vec::new())]);

        run_pump(
            sender,
            handler.clone(),
            small_config(),
            0,
            0,
            handler.epoch(),
        )
        .await
        .unwrap();

        let frames = collect_frames(&receiver).await;
        assert_eq!(frames.len(), 3);
        assert!(matches!(
            frames[0],
            InboundFrame::Control(ControlFrame::FileStart {
                file_index: 0,
                size: 0,
                ..
            })
        ));
        assert!(matches!(
            frames[1],
            InboundFrame::Control(ControlFrame::FileComplete { file_index: 0 })
        ));
    }

    #[tokio::test]
    async fn zero_file_manifest_goes_straight_to_all_complete() {
        let (sender, receiver) = memory::pair(NetworkClass::Lan);
        let handler = handler_for(Vec::new());

        run_pump(
            sender,
            handler.clone(),
            small_config(),
            0,
            0,
            handler.epoch(),
        )
        .await
        .unwrap();

        let frames = collect_frames(&receiver).await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            frames[0],
            InboundFrame::Control(ControlFrame::AllComplete)
        ));
    }

    #[tokio::test]
    async fn resume_seed_skips_ahead_and_seeks() {
        let (sender, receiver) = memory::pair(NetworkClass::Lan);
        let payload = test_data(2000);
        let handler = handler_for(vec![
            source("done.bin", test_data(500)),
            source("partial.bin", payload.clone()),
        ]);

        run_pump(
            sender,
            handler.clone(),
            small_config(),
            1,
            700,
            handler.epoch(),
        )
        .await
        .unwrap();

        let frames = collect_frames(&receiver).await;
        // File 0 is never re-sent.
        assert!(matches!(
            frames[0],
            InboundFrame::Control(ControlFrame::FileStart {
                file_index: 1,
                size: 1300,
                ..
            })
        ));
        let resumed: Vec<u8> = frames[1..frames.len() - 2]
            .iter()
            .flat_map(|f| match f {
                InboundFrame::Binary(data) => data.to_vec(),
                other => panic!("unexpected frame: {other:?}"),
            })
            .collect();
        assert_eq!(resumed, payload[700..]);
    }

    /// Channel wrapper recording the buffered amount seen by each
    /// `send_binary`.
    #[derive(Clone)]
    struct SpyChannel {
        inner: MemoryChannel,
        observed: Arc<Mutex<Vec<u64>>>,
    }

    impl Channel for SpyChannel {
        fn send_control(
            &self,
            frame: ControlFrame,
        ) -> Result<(), ChannelClosed> {
            self.inner.send_control(frame)
        }

        fn send_binary(&self, data: Bytes) -> Result<(), ChannelClosed> {
            self.observed
                .lock()
                .unwrap()
                .push(self.inner.buffered_amount());
            self.inner.send_binary(data)
        }

        async fn recv(&self) -> Option<InboundFrame> {
            self.inner.recv().await
        }

        fn buffered_amount(&self) -> u64 {
            self.inner.buffered_amount()
        }

        async fn drained_to(&self, low: u64) {
            self.inner.drained_to(low).await
        }

        fn network_class(&self) -> NetworkClass {
            self.inner.network_class()
        }

        fn close(&self, reason: CloseReason) {
            self.inner.close(reason)
        }
    }

    #[tokio::test]
    async fn producer_never_sends_past_the_high_watermark() {
        // A slow link so the outbound queue actually fills.
        let (sender, receiver) = memory::pair_throttled(
            NetworkClass::Wan,
            Some(LinkThrottle {
                quantum: 4 * 1024,
                interval: Duration::from_millis(1),
            }),
        );
        let observed = Arc::new(Mutex::new(Vec::new()));
        let spy = SpyChannel {
            inner: sender,
            observed: observed.clone(),
        };

        let handler = handler_for(vec![source("big.bin", test_data(256 * 1024))]);
        let config = small_config();
        let high = config.high_watermark;

        let drain = tokio::spawn(async move {
            while let Some(frame) = receiver.recv().await {
                if matches!(
                    frame,
                    InboundFrame::Control(ControlFrame::AllComplete)
                ) {
                    break;
                }
            }
        });

        run_pump(spy, handler.clone(), config, 0, 0, handler.epoch())
            .await
            .unwrap();
        drain.await.unwrap();

        let observed = observed.lock().unwrap();
        assert!(!observed.is_empty());
        // Every send was issued strictly below the high mark; once the mark
        // was reached the producer waited for the drain to the low mark.
        assert!(observed.iter().all(|&buffered| buffered < high));
        // The link was slow enough that the queue actually climbed near the
        // mark at least once.
        assert!(observed.iter().any(|&buffered| buffered >= high / 2));
    }

    #[tokio::test]
    async fn bumped_epoch_stops_the_producer() {
        let (sender, receiver) = memory::pair_throttled(
            NetworkClass::Wan,
            Some(LinkThrottle {
                quantum: 1024,
                interval: Duration::from_millis(1),
            }),
        );
        let handler = handler_for(vec![source("big.bin", test_data(1 << 20))]);
        let epoch = handler.epoch();

        let pump = tokio::spawn(run_pump(
            sender,
            handler.clone(),
            small_config(),
            0,
            0,
            epoch,
        ));

        // Let some frames through, then invalidate the epoch.
        let mut seen = 0;
        while seen < 3 {
            if matches!(receiver.recv().await, Some(InboundFrame::Binary(_))) {
                seen += 1;
            }
        }
        handler.bump_epoch();

        assert!(matches!(
            pump.await.unwrap(),
            Ok(PumpOutcome::Superseded)
        ));
    }
}
