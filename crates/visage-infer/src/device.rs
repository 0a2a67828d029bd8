//! Device-side primitives the executors run against: per-thread device
//! selection, an in-order stream of deferred operations, device-resident
//! tensors, and pinned host staging for device-to-host copies.
//!
//! Work scheduled on a [`Stream`] is not host-visible until `synchronize`
//! returns; callers that read staging memory early observe stale data, the
//! same hazard the real driver exposes.

use crate::InferError;
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

thread_local! {
    static CURRENT_DEVICE: Cell<i32> = const { Cell::new(-1) };
}

/// Select the device for the calling thread. Session entry points call this
/// before touching executor state; the selection is sticky per thread.
pub fn set_device(device: i32) -> Result<(), InferError> {
    if device < 0 {
        return Err(InferError::InvalidDevice(device));
    }
    CURRENT_DEVICE.with(|d| d.set(device));
    Ok(())
}

/// The device selected on the calling thread, or -1 when none has been set.
pub fn current_device() -> i32 {
    CURRENT_DEVICE.with(|d| d.get())
}

type StreamOp = Box<dyn FnOnce() + Send>;

/// An in-order queue of deferred device operations.
///
/// Clones share the same queue; any clone may enqueue or synchronize.
#[derive(Clone)]
pub struct Stream {
    ops: Arc<Mutex<VecDeque<StreamOp>>>,
}

impl Stream {
    pub fn new() -> Self {
        Self {
            ops: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn enqueue(&self, op: impl FnOnce() + Send + 'static) {
        self.ops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Box::new(op));
    }

    /// Run every queued operation in enqueue order. Returns once the queue
    /// is drained; afterwards all copies are host-visible.
    pub fn synchronize(&self) {
        loop {
            let op = self
                .ops
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            match op {
                Some(op) => op(),
                None => break,
            }
        }
    }

    pub fn pending_ops(&self) -> usize {
        self.ops.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether two handles refer to the same underlying stream.
    pub fn same_stream(&self, other: &Stream) -> bool {
        Arc::ptr_eq(&self.ops, &other.ops)
    }
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

/// A device-resident float buffer. Contents are immutable once produced and
/// reach the host only through [`PinnedBuffer::copy_from_device`].
#[derive(Clone)]
pub struct DeviceTensor {
    data: Arc<Vec<f32>>,
}

impl DeviceTensor {
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self { data: Arc::new(data) }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn shared(&self) -> Arc<Vec<f32>> {
        self.data.clone()
    }
}

/// Page-locked host staging memory for asynchronous device-to-host copies.
///
/// Clones share the same allocation; the session keeps one handle and the
/// copies scheduled on the stream keep another.
#[derive(Clone)]
pub struct PinnedBuffer {
    data: Arc<Mutex<Vec<f32>>>,
    capacity: usize,
}

impl PinnedBuffer {
    /// Allocate `capacity` zeroed floats.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![0.0; capacity])),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Schedule a copy of `src` into `[offset, offset + src.len())` on
    /// `stream`. The bytes land when the stream is synchronized.
    pub fn copy_from_device(
        &self,
        offset: usize,
        src: &DeviceTensor,
        stream: &Stream,
    ) -> Result<(), InferError> {
        let end = offset
            .checked_add(src.len())
            .ok_or_else(|| InferError::Staging("copy range overflows".to_string()))?;
        if end > self.capacity {
            return Err(InferError::Staging(format!(
                "copy range {offset}..{end} exceeds staging capacity {}",
                self.capacity
            )));
        }

        let dst = self.data.clone();
        let src = src.shared();
        stream.enqueue(move || {
            let mut dst = dst.lock().unwrap_or_else(|e| e.into_inner());
            dst[offset..offset + src.len()].copy_from_slice(&src);
        });
        Ok(())
    }

    /// Read `len` floats at `offset`. Only meaningful after the stream that
    /// carried the copies has been synchronized.
    pub fn read(&self, offset: usize, len: usize) -> Vec<f32> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data[offset..offset + len].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_device_rejects_negative() {
        assert!(matches!(set_device(-1), Err(InferError::InvalidDevice(-1))));
        set_device(0).unwrap();
        assert_eq!(current_device(), 0);
    }

    #[test]
    fn test_copy_not_visible_before_synchronize() {
        let stream = Stream::new();
        let staging = PinnedBuffer::new(4);
        let src = DeviceTensor::from_vec(vec![1.0, 2.0]);

        staging.copy_from_device(0, &src, &stream).unwrap();
        assert_eq!(staging.read(0, 2), vec![0.0, 0.0]);
        assert_eq!(stream.pending_ops(), 1);

        stream.synchronize();
        assert_eq!(staging.read(0, 2), vec![1.0, 2.0]);
        assert_eq!(stream.pending_ops(), 0);
    }

    #[test]
    fn test_copies_run_in_enqueue_order() {
        let stream = Stream::new();
        let staging = PinnedBuffer::new(2);
        staging
            .copy_from_device(0, &DeviceTensor::from_vec(vec![1.0, 1.0]), &stream)
            .unwrap();
        staging
            .copy_from_device(0, &DeviceTensor::from_vec(vec![2.0, 2.0]), &stream)
            .unwrap();
        stream.synchronize();
        assert_eq!(staging.read(0, 2), vec![2.0, 2.0]);
    }

    #[test]
    fn test_copy_out_of_bounds_rejected() {
        let stream = Stream::new();
        let staging = PinnedBuffer::new(2);
        let src = DeviceTensor::from_vec(vec![0.0; 3]);
        assert!(matches!(
            staging.copy_from_device(0, &src, &stream),
            Err(InferError::Staging(_))
        ));
    }

    #[test]
    fn test_same_stream_identity() {
        let a = Stream::new();
        let b = a.clone();
        let c = Stream::new();
        assert!(a.same_stream(&b));
        assert!(!a.same_stream(&c));
    }
}
