//! 动图推送：`Decoding → Dispatching → Streaming → Done | Aborted`
//!
//! 每帧一个单次写入的投递槽，在派发前全部建好；派发任务与推送循环并行运行，
//! 推送循环严格按帧序等待槽位，因此输出顺序与工作线程的完成顺序无关。

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use axum::body::Bytes;
use image::RgbaImage;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::AppError;
use crate::features::art::{RenderOptions, render};
use crate::worker::pool::panic_message;

use super::cache;
use super::decode::{self, DecodeLimits};
use super::service::ConversionService;

/// 每条记录的前缀
pub const RECORD_PREFIX: &[u8] = b"data: ";
/// 光标归位控制序列，让终端在原位置重绘下一帧
pub const CURSOR_HOME: &[u8] = b"\x1b[H";
/// 记录结束符
pub const RECORD_TERMINATOR: &[u8] = b"\n\n";

/// 解码并计算好指纹、等待派发的一帧
#[derive(Debug)]
pub struct PreparedFrame {
    pixels: RgbaImage,
    key: String,
    pub delay: Duration,
}

/// 推送结局
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed { frames: usize },
    Aborted { written: usize, reason: AbortReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// 客户端断开或取消信号触发
    ClientGone,
    /// 该帧的转换失败（任务 panic 或线程池关闭），之后的帧不再推送
    FrameLost { index: usize },
}

type FrameWriter = oneshot::Sender<Bytes>;
type FrameSlot = oneshot::Receiver<Bytes>;

/// 为 `n` 帧各建一个单次写入槽：写端交给任务，读端留给推送循环
fn frame_slots(n: usize) -> (Vec<FrameWriter>, Vec<FrameSlot>) {
    (0..n).map(|_| oneshot::channel()).unzip()
}

/// 拼出一条完整记录：`data: ` + 光标归位 + 帧文本 + 空行
pub fn frame_record(text: &[u8]) -> Bytes {
    let mut record = Vec::with_capacity(
        RECORD_PREFIX.len() + CURSOR_HOME.len() + text.len() + RECORD_TERMINATOR.len(),
    );
    record.extend_from_slice(RECORD_PREFIX);
    record.extend_from_slice(CURSOR_HOME);
    record.extend_from_slice(text);
    record.extend_from_slice(RECORD_TERMINATOR);
    Bytes::from(record)
}

/// 同一请求内像素完全相同的帧共用一个任务
struct FrameGroup {
    key: String,
    pixels: RgbaImage,
    writers: Vec<FrameWriter>,
}

fn group_identical(frames: Vec<PreparedFrame>, writers: Vec<FrameWriter>) -> Vec<FrameGroup> {
    let mut groups: Vec<FrameGroup> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();
    for (frame, writer) in frames.into_iter().zip(writers) {
        match by_key.get(&frame.key) {
            Some(&idx) => groups[idx].writers.push(writer),
            None => {
                by_key.insert(frame.key.clone(), groups.len());
                groups.push(FrameGroup {
                    key: frame.key,
                    pixels: frame.pixels,
                    writers: vec![writer],
                });
            }
        }
    }
    groups
}

impl ConversionService {
    /// Decoding：一次性解码全部帧并计算每帧指纹，失败时在推送开始前返回错误。
    ///
    /// 任何解码失败（包括无法识别的格式与超限）都按无效动图处理。
    pub async fn prepare_animation(
        &self,
        upload: Bytes,
        opts: RenderOptions,
    ) -> Result<Vec<PreparedFrame>, AppError> {
        let limits = DecodeLimits::from(&self.settings);
        let frames = tokio::task::spawn_blocking(move || {
            decode::decode_animation(&upload, &limits).map(|frames| {
                frames
                    .into_iter()
                    .map(|f| PreparedFrame {
                        key: cache::frame_key(f.pixels.as_raw(), &opts),
                        pixels: f.pixels,
                        delay: f.delay,
                    })
                    .collect::<Vec<_>>()
            })
        })
        .await?
        .map_err(|e| AppError::InvalidAnimation(e.to_string()))?;
        Ok(frames)
    }

    /// Dispatching + Streaming：把帧写入 `sink`，每帧写完后按其 delay 停顿。
    ///
    /// 非正常结束时会触发 `cancel`，尚未开始的帧任务随之跳过；
    /// 已在运行的任务照常完成，其缓存写入保留。
    pub async fn stream_frames(
        &self,
        frames: Vec<PreparedFrame>,
        opts: RenderOptions,
        sink: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> StreamOutcome {
        let delays: Vec<Duration> = frames.iter().map(|f| f.delay).collect();
        let (writers, slots) = frame_slots(frames.len());

        tokio::spawn(
            self.clone()
                .dispatch_frames(frames, writers, opts, cancel.clone()),
        );

        let outcome = emit_in_order(slots, &delays, &sink, &cancel).await;
        if !matches!(outcome, StreamOutcome::Completed { .. }) {
            cancel.cancel();
        }
        outcome
    }

    async fn dispatch_frames(
        self,
        frames: Vec<PreparedFrame>,
        writers: Vec<FrameWriter>,
        opts: RenderOptions,
        cancel: CancellationToken,
    ) {
        let total = frames.len();
        let groups = group_identical(frames, writers);
        debug!(frames = total, unique = groups.len(), "开始派发帧任务");

        for group in groups {
            if cancel.is_cancelled() {
                debug!("推送已终止，停止派发剩余帧");
                return;
            }
            if let Some(text) = self.cache.get(&group.key).await {
                for writer in group.writers {
                    let _ = writer.send(text.clone());
                }
                continue;
            }

            let job = self.frame_job(group, opts, cancel.clone());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                submitted = self.pool.submit(job) => {
                    if submitted.is_err() {
                        warn!("线程池已关闭，停止派发剩余帧");
                        return;
                    }
                }
            }
        }
    }

    fn frame_job(
        &self,
        group: FrameGroup,
        opts: RenderOptions,
        cancel: CancellationToken,
    ) -> impl FnOnce() + Send + 'static {
        let cache = self.cache.clone();
        let runtime = self.runtime.clone();
        move || {
            if cancel.is_cancelled() {
                return;
            }
            let FrameGroup {
                key,
                pixels,
                writers,
            } = group;
            match catch_unwind(AssertUnwindSafe(|| render(&pixels, &opts))) {
                Ok(text) => {
                    let text = Bytes::from(text);
                    cache.spawn_store(&runtime, key, text.clone());
                    for writer in writers {
                        let _ = writer.send(text.clone());
                    }
                }
                // 写端随之 drop，推送循环在该槽位上观察到帧丢失
                Err(payload) => error!(panic = %panic_message(payload.as_ref()), "帧转换 panic"),
            }
        }
    }
}

/// Streaming：按帧序等待槽位；每帧写出后停顿该帧的 delay。
async fn emit_in_order(
    slots: Vec<FrameSlot>,
    delays: &[Duration],
    sink: &mpsc::Sender<Bytes>,
    cancel: &CancellationToken,
) -> StreamOutcome {
    let gone = |written| StreamOutcome::Aborted {
        written,
        reason: AbortReason::ClientGone,
    };

    for (index, (slot, delay)) in slots.into_iter().zip(delays).enumerate() {
        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => return gone(index),
            _ = sink.closed() => return gone(index),
            delivered = slot => match delivered {
                Ok(text) => text,
                Err(_) => {
                    return StreamOutcome::Aborted {
                        written: index,
                        reason: AbortReason::FrameLost { index },
                    };
                }
            },
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return gone(index),
            sent = sink.send(frame_record(&text)) => {
                if sent.is_err() {
                    return gone(index);
                }
            }
        }

        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return gone(index + 1),
                _ = sink.closed() => return gone(index + 1),
                _ = tokio::time::sleep(*delay) => {}
            }
        }
    }

    StreamOutcome::Completed {
        frames: delays.len(),
    }
}
