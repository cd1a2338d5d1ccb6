use bytes::{Bytes, BytesMut};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;

use crate::error::{ConnectionError, READ, Result};

type Completion = oneshot::Sender<Result<Bytes>>;

/// 入站缓冲与读仲裁器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 套接字以任意大小、任意时机交付数据，而帧层需要“恰好读满 N 字节”；
///   该结构负责在两者之间做仲裁，保证每个字节按到达顺序、恰好交付一次。
///
/// ## 逻辑 (How)
/// - 缓冲区、挂起读请求槽位与关闭标志共享一把 `std::sync::Mutex`，
///   这把锁即“追加并检查”序列的独立互斥域，从不跨越 `.await` 持有；
/// - [`InboundBuffer::on_data`] 在同一临界区内追加字节并检查挂起请求，
///   满足时直接从队首切出恰好 `required` 字节交给等待者，因此等待者醒来时
///   不会观察到被并发修改的快照；
/// - [`InboundBuffer::close`] 拒绝挂起请求并丢弃残留字节；关闭后新的注册立即失败，
///   消除“检查已连接”与“注册挂起请求”之间的竞态窗口。
///
/// ## 契约 (What)
/// - 同一时刻至多一个挂起请求，由调用方的读锁保证；
/// - 不存在短读：要么交付全部 `len` 字节，要么返回错误。
#[derive(Debug)]
pub(crate) struct InboundBuffer {
    state: Mutex<InboundState>,
}

#[derive(Debug)]
struct InboundState {
    buffer: BytesMut,
    pending: Option<PendingSlot>,
    closed: bool,
    next_ticket: u64,
}

#[derive(Debug)]
struct PendingSlot {
    ticket: u64,
    required: usize,
    completion: Completion,
}

/// 读请求的即时结果。
pub(crate) enum ReadOutcome<'a> {
    /// 缓冲区已有足够字节，已从队首切出。
    Ready(Bytes),
    /// 已登记挂起请求，等待数据到达或连接关闭。
    Pending(PendingRead<'a>),
}

impl InboundBuffer {
    /// 新建的缓冲区处于关闭状态，需在套接字建立后 [`InboundBuffer::reopen`]。
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(InboundState {
                buffer: BytesMut::new(),
                pending: None,
                closed: true,
                next_ticket: 0,
            }),
        }
    }

    /// 为新的套接字实例清空状态并开放注册。
    pub(crate) fn reopen(&self) {
        let mut state = self.lock();
        state.buffer.clear();
        state.pending = None;
        state.closed = false;
    }

    /// 当前缓冲的字节数。
    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.lock().buffer.len()
    }

    #[cfg(test)]
    pub(crate) fn has_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// 数据到达路径：追加整块数据，若挂起请求已被满足则交付。
    ///
    /// 返回值表示本次调用是否满足了挂起请求。
    pub(crate) fn on_data(&self, chunk: &[u8]) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.buffer.extend_from_slice(chunk);

        let satisfied = state
            .pending
            .as_ref()
            .is_some_and(|pending| state.buffer.len() >= pending.required);
        if !satisfied {
            return false;
        }

        let Some(pending) = state.pending.take() else {
            return false;
        };
        let bytes = state.buffer.split_to(pending.required).freeze();
        if let Err(Ok(unclaimed)) = pending.completion.send(Ok(bytes)) {
            // 等待者已被取消且尚未回收；字节放回队首。
            state.restore_front(&unclaimed);
            return false;
        }
        true
    }

    /// 关闭路径：拒绝挂起请求并丢弃残留字节。
    ///
    /// 返回值表示是否拒绝了一个挂起请求。
    pub(crate) fn close(&self) -> bool {
        let mut state = self.lock();
        state.closed = true;
        state.buffer.clear();
        match state.pending.take() {
            Some(pending) => {
                let _ = pending
                    .completion
                    .send(Err(ConnectionError::not_open(READ)));
                true
            }
            None => false,
        }
    }

    /// 读取恰好 `len` 字节：缓冲足够时立即返回，否则登记挂起请求。
    pub(crate) fn take_or_register(&self, len: usize) -> Result<ReadOutcome<'_>> {
        let mut state = self.lock();
        if state.closed {
            return Err(ConnectionError::not_open(READ));
        }
        if state.buffer.len() >= len {
            return Ok(ReadOutcome::Ready(state.buffer.split_to(len).freeze()));
        }

        debug_assert!(
            state.pending.is_none(),
            "a second read registered while one is pending"
        );
        let (completion, receiver) = oneshot::channel();
        let ticket = state.next_ticket;
        state.next_ticket = state.next_ticket.wrapping_add(1);
        state.pending = Some(PendingSlot {
            ticket,
            required: len,
            completion,
        });
        Ok(ReadOutcome::Pending(PendingRead {
            inbound: self,
            ticket,
            receiver: Some(receiver),
        }))
    }

    fn cancel(&self, ticket: u64, unclaimed: Option<Bytes>) {
        let mut state = self.lock();
        if state
            .pending
            .as_ref()
            .is_some_and(|pending| pending.ticket == ticket)
        {
            state.pending = None;
        }
        if let Some(bytes) = unclaimed
            && !state.closed
        {
            state.restore_front(&bytes);
        }
    }

    fn lock(&self) -> MutexGuard<'_, InboundState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl InboundState {
    fn restore_front(&mut self, bytes: &[u8]) {
        let mut merged = BytesMut::with_capacity(bytes.len() + self.buffer.len());
        merged.extend_from_slice(bytes);
        merged.extend_from_slice(&self.buffer);
        self.buffer = merged;
    }
}

/// 已登记的挂起读请求。
///
/// 在完成前被丢弃（调用方自行叠加的超时或取消）时，会注销槽位并把已切出但未被
/// 领取的字节放回缓冲区队首，保证取消不丢字节、不乱序。
pub(crate) struct PendingRead<'a> {
    inbound: &'a InboundBuffer,
    ticket: u64,
    receiver: Option<oneshot::Receiver<Result<Bytes>>>,
}

impl PendingRead<'_> {
    /// 挂起直到数据到达路径交付字节，或关闭路径拒绝请求。
    pub(crate) async fn wait(mut self) -> Result<Bytes> {
        let outcome = match self.receiver.as_mut() {
            Some(receiver) => receiver.await,
            None => return Err(ConnectionError::not_open(READ)),
        };
        self.receiver = None;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::not_open(READ)),
        }
    }
}

impl Drop for PendingRead<'_> {
    fn drop(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
            let unclaimed = receiver.try_recv().ok().and_then(|result| result.ok());
            self.inbound.cancel(self.ticket, unclaimed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn open_buffer() -> InboundBuffer {
        let inbound = InboundBuffer::new();
        inbound.reopen();
        inbound
    }

    fn expect_pending(outcome: Result<ReadOutcome<'_>>) -> PendingRead<'_> {
        match outcome.expect("注册读请求") {
            ReadOutcome::Pending(pending) => pending,
            ReadOutcome::Ready(bytes) => panic!("unexpected immediate read: {bytes:?}"),
        }
    }

    fn expect_ready(outcome: Result<ReadOutcome<'_>>) -> Bytes {
        match outcome.expect("读取缓冲") {
            ReadOutcome::Ready(bytes) => bytes,
            ReadOutcome::Pending(_) => panic!("read should not suspend"),
        }
    }

    #[tokio::test]
    async fn pending_read_resolves_after_enough_chunks() {
        let inbound = open_buffer();
        let pending = expect_pending(inbound.take_or_register(3));

        assert!(!inbound.on_data(&[0x01, 0x02]));
        assert!(inbound.has_pending());
        assert!(inbound.on_data(&[0x03]));
        assert!(!inbound.has_pending());

        let bytes = pending.wait().await.expect("读请求应被满足");
        assert_eq!(&bytes[..], &[0x01, 0x02, 0x03]);
        assert_eq!(inbound.buffered(), 0);
    }

    #[tokio::test]
    async fn ready_read_leaves_remainder_buffered() {
        let inbound = open_buffer();
        inbound.on_data(&[0xAA, 0xBB, 0xCC]);

        let bytes = expect_ready(inbound.take_or_register(2));
        assert_eq!(&bytes[..], &[0xAA, 0xBB]);
        assert_eq!(inbound.buffered(), 1);

        let rest = expect_ready(inbound.take_or_register(1));
        assert_eq!(&rest[..], &[0xCC]);
    }

    #[tokio::test]
    async fn surplus_bytes_stay_queued_after_satisfaction() {
        let inbound = open_buffer();
        let pending = expect_pending(inbound.take_or_register(2));
        inbound.on_data(&[1, 2, 3, 4]);
        inbound.on_data(&[5]);

        assert_eq!(&pending.wait().await.expect("满足")[..], &[1, 2]);
        assert_eq!(&expect_ready(inbound.take_or_register(3))[..], &[3, 4, 5]);
    }

    #[tokio::test]
    async fn close_rejects_pending_read_and_discards_bytes() {
        let inbound = open_buffer();
        let pending = expect_pending(inbound.take_or_register(5));
        inbound.on_data(&[1, 2]);

        assert!(inbound.close());
        let err = pending.wait().await.expect_err("关闭应拒绝挂起读");
        assert!(err.is_not_open());
        assert_eq!(inbound.buffered(), 0);
        assert!(!inbound.close(), "no pending read left to reject");
    }

    #[tokio::test]
    async fn registration_after_close_fails_immediately() {
        let inbound = open_buffer();
        inbound.close();
        assert!(matches!(
            inbound.take_or_register(1),
            Err(ConnectionError::NotOpen { .. })
        ));
        assert!(!inbound.on_data(&[1]));
        assert_eq!(inbound.buffered(), 0);
    }

    #[test]
    fn fresh_buffer_is_closed_until_reopened() {
        let inbound = InboundBuffer::new();
        assert!(inbound.take_or_register(1).is_err());
        inbound.reopen();
        assert!(inbound.take_or_register(0).is_ok());
    }

    #[tokio::test]
    async fn cancelled_read_unregisters_before_data() {
        let inbound = open_buffer();
        let pending = expect_pending(inbound.take_or_register(4));
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending.wait()).await;
        assert!(timed_out.is_err());
        assert!(!inbound.has_pending());

        inbound.on_data(&[9, 8, 7, 6]);
        assert_eq!(&expect_ready(inbound.take_or_register(4))[..], &[9, 8, 7, 6]);
    }

    #[test]
    fn cancelled_read_returns_unclaimed_bytes_to_front() {
        let inbound = open_buffer();
        let pending = expect_pending(inbound.take_or_register(2));
        assert!(inbound.on_data(&[1, 2, 3]));
        inbound.on_data(&[4]);
        drop(pending);

        assert_eq!(inbound.buffered(), 4);
        assert_eq!(&expect_ready(inbound.take_or_register(4))[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn reopen_resets_previous_stream() {
        let inbound = open_buffer();
        inbound.on_data(&[1, 2, 3]);
        inbound.reopen();
        assert_eq!(inbound.buffered(), 0);
    }
}
