use std::collections::VecDeque;

use tokio::sync::watch;

use crate::{Buffer, Error, Result, TrackEvent};

// FIXME: find smarter limit based on download rate and stream bandwidth
const MAX_BYTES: usize = 256 * 1024;

/// One item travelling from a track's producer to its consumer.
#[derive(Clone, Debug)]
pub enum QueueItem {
	Buffer(Buffer),
	Event(TrackEvent),
}

impl QueueItem {
	/// Bytes counted against the queue budget; events are invisible.
	fn size(&self) -> usize {
		match self {
			QueueItem::Buffer(buffer) => buffer.data.len(),
			QueueItem::Event(_) => 0,
		}
	}
}

#[derive(Default)]
struct QueueState {
	items: VecDeque<QueueItem>,
	bytes: usize,
	flushing: bool,
}

/// Producer half of a track's output queue.
///
/// A bounded FIFO of buffers and events between the track engine and its
/// consumer. Buffers count against a byte budget and suspend the producer
/// while it is exhausted; events bypass the budget. Single producer, single
/// consumer; clones of this handle are only used to drive the flushing
/// protocol.
#[derive(Clone)]
pub struct QueueProducer {
	state: watch::Sender<QueueState>,
}

impl QueueProducer {
	pub fn new() -> Self {
		Self {
			state: Default::default(),
		}
	}

	/// Create the consumer half.
	pub fn consumer(&self) -> QueueConsumer {
		QueueConsumer {
			state: self.state.clone(),
		}
	}

	/// Push an item, suspending while the byte budget is exhausted.
	///
	/// Returns [Error::Flushing] while the queue is flushing.
	pub async fn push(&self, item: QueueItem) -> Result<()> {
		let mut slot = Some(item);
		let mut changed = self.state.subscribe();

		loop {
			let mut flushing = false;
			self.state.send_if_modified(|state| {
				if state.flushing {
					flushing = true;
					return false;
				}
				if state.bytes > MAX_BYTES {
					return false;
				}
				if let Some(item) = slot.take() {
					state.bytes += item.size();
					state.items.push_back(item);
				}
				true
			});

			if flushing {
				return Err(Error::Flushing);
			}
			if slot.is_none() {
				return Ok(());
			}
			if changed.changed().await.is_err() {
				return Err(Error::Flushing);
			}
		}
	}

	/// Push an item immediately, bypassing the byte budget.
	///
	/// Used for events, which must not block behind buffered payload.
	pub fn push_force(&self, item: QueueItem) -> Result<()> {
		let mut flushing = false;
		let mut slot = Some(item);

		self.state.send_if_modified(|state| {
			if state.flushing {
				flushing = true;
				return false;
			}
			if let Some(item) = slot.take() {
				state.bytes += item.size();
				state.items.push_back(item);
			}
			true
		});

		if flushing {
			return Err(Error::Flushing);
		}
		Ok(())
	}

	/// While flushing, concurrent pushes and pops fail instead of blocking.
	pub fn set_flushing(&self, flushing: bool) {
		self.state.send_modify(|state| state.flushing = flushing);
	}

	/// Discard all queued items.
	pub fn flush(&self) {
		self.state.send_modify(|state| {
			state.items.clear();
			state.bytes = 0;
		});
	}
}

impl Default for QueueProducer {
	fn default() -> Self {
		Self::new()
	}
}

/// Consumer half of a track's output queue.
pub struct QueueConsumer {
	state: watch::Sender<QueueState>,
}

impl QueueConsumer {
	/// Pop the next item, suspending while the queue is empty.
	///
	/// Returns [Error::Flushing] while the queue is flushing.
	pub async fn pop(&mut self) -> Result<QueueItem> {
		let mut changed = self.state.subscribe();

		loop {
			let mut result = None;
			self.state.send_if_modified(|state| {
				if state.flushing {
					result = Some(Err(Error::Flushing));
					return false;
				}
				match state.items.pop_front() {
					Some(item) => {
						state.bytes -= item.size();
						result = Some(Ok(item));
						true
					}
					None => false,
				}
			});

			if let Some(result) = result {
				return result;
			}
			if changed.changed().await.is_err() {
				return Err(Error::Flushing);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;
	use futures::FutureExt;

	fn buffer(size: usize) -> QueueItem {
		QueueItem::Buffer(Buffer {
			data: Bytes::from(vec![0u8; size]),
			pts: None,
			discont: false,
			offset: 0,
			offset_end: size as u64,
		})
	}

	#[tokio::test]
	async fn fifo_order() {
		let producer = QueueProducer::new();
		let mut consumer = producer.consumer();

		producer.push(buffer(1)).await.unwrap();
		producer.push_force(QueueItem::Event(TrackEvent::Eos)).unwrap();
		producer.push(buffer(2)).await.unwrap();

		assert!(matches!(consumer.pop().await.unwrap(), QueueItem::Buffer(b) if b.data.len() == 1));
		assert!(matches!(consumer.pop().await.unwrap(), QueueItem::Event(TrackEvent::Eos)));
		assert!(matches!(consumer.pop().await.unwrap(), QueueItem::Buffer(b) if b.data.len() == 2));
	}

	#[tokio::test]
	async fn pop_blocks_on_empty() {
		let producer = QueueProducer::new();
		let mut consumer = producer.consumer();

		assert!(consumer.pop().now_or_never().is_none());
	}

	#[tokio::test]
	async fn budget_blocks_producer() {
		let producer = QueueProducer::new();
		let mut consumer = producer.consumer();

		// the budget only rejects once it is exceeded, so two 200 KiB
		// buffers fit but a third must wait
		producer.push(buffer(200 * 1024)).await.unwrap();
		producer.push(buffer(200 * 1024)).await.unwrap();
		assert!(producer.push(buffer(200 * 1024)).now_or_never().is_none());

		// events are not subject to the budget
		producer.push_force(QueueItem::Event(TrackEvent::Eos)).unwrap();

		// draining one buffer unblocks the producer
		consumer.pop().await.unwrap();
		assert!(producer.push(buffer(200 * 1024)).now_or_never().is_some());
	}

	#[tokio::test]
	async fn flushing_fails_both_ends() {
		let producer = QueueProducer::new();
		let mut consumer = producer.consumer();

		producer.push(buffer(1)).await.unwrap();
		producer.set_flushing(true);

		assert!(matches!(producer.push(buffer(1)).await, Err(Error::Flushing)));
		assert!(matches!(
			producer.push_force(QueueItem::Event(TrackEvent::Eos)),
			Err(Error::Flushing)
		));
		assert!(matches!(consumer.pop().await, Err(Error::Flushing)));

		// flush discards the pending item; after clearing the flag the
		// queue works again
		producer.flush();
		producer.set_flushing(false);
		assert!(consumer.pop().now_or_never().is_none());
		producer.push(buffer(3)).await.unwrap();
		assert!(matches!(consumer.pop().await.unwrap(), QueueItem::Buffer(b) if b.data.len() == 3));
	}

	#[tokio::test]
	async fn flushing_wakes_blocked_pop() {
		let producer = QueueProducer::new();
		let mut consumer = producer.consumer();

		let pop = tokio::spawn(async move { consumer.pop().await });
		tokio::task::yield_now().await;

		producer.set_flushing(true);
		assert!(matches!(pop.await.unwrap(), Err(Error::Flushing)));
	}
}
