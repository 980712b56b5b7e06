//! Cross-domain remoting: the per-domain message queue, the wait-object
//! handshake for synchronous calls, and the class-driven serializer for
//! typed payloads.
//!
//! Each domain runs on its own OS thread. Senders serialise arguments
//! into a buffer, enqueue a message, and block on a per-sender wait
//! object until the target's listen loop dequeues, dispatches through the
//! emitted server stub, and serialises the return value back.

use skizo_metadata::{Metadata, MethodId, PrimType, SpecialClass, TypeRef, TypeRefKind};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use thiserror::Error;

/// A synchronous cross-domain call times out after this long.
pub const REMOTE_CALL_TIMEOUT: Duration = Duration::from_secs(2);
/// Waiting for a freshly created domain to become ready.
pub const DOMAIN_TIMEOUT: Duration = Duration::from_secs(3);
/// The listen loop's poll interval.
pub const MESSAGEQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum RemotingError {
    #[error("Remote call timed out")]
    Timeout,
    #[error("Remote domain is not ready")]
    DomainNotReady,
    #[error("Exported object '{0}' not found")]
    UnknownObject(String),
    #[error("Value of type '{0}' cannot cross a domain boundary")]
    Unserializable(String),
    #[error("Malformed remoting payload")]
    Format,
}

/// One synchronous request. The response slot doubles as the sender's
/// wait object.
pub struct DomainMessage {
    pub target_name: String,
    pub method: MethodId,
    pub payload: Vec<u8>,
    pub response: Arc<ResponseSlot>,
}

#[derive(Default)]
pub struct ResponseSlot {
    value: Mutex<Option<Result<Vec<u8>, String>>>,
    ready: Condvar,
}

impl ResponseSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn complete(&self, result: Result<Vec<u8>, String>) {
        let mut slot = self.value.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(result);
        self.ready.notify_all();
    }

    pub fn wait(&self, timeout: Duration) -> Result<Vec<u8>, RemotingError> {
        let mut slot = self.value.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = std::time::Instant::now() + timeout;
        while slot.is_none() {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(RemotingError::Timeout);
            }
            let (guard, wait_result) = self
                .ready
                .wait_timeout(slot, remaining)
                .unwrap_or_else(|e| e.into_inner());
            slot = guard;
            if wait_result.timed_out() && slot.is_none() {
                return Err(RemotingError::Timeout);
            }
        }
        match slot.take().expect("checked above") {
            Ok(bytes) => Ok(bytes),
            Err(message) => Err(RemotingError::Unserializable(message)),
        }
    }
}

/// Many senders, one receiver (the owning domain's thread).
#[derive(Default)]
pub struct MessageQueue {
    inner: Mutex<VecDeque<DomainMessage>>,
    available: Condvar,
}

impl MessageQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enqueue(&self, message: DomainMessage) {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(message);
        self.available.notify_one();
    }

    /// Polls for the next message, waiting at most `timeout`.
    pub fn dequeue(&self, timeout: Duration) -> Option<DomainMessage> {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(message) = queue.pop_front() {
            return Some(message);
        }
        let (mut queue, _) = self
            .available
            .wait_timeout(queue, timeout)
            .unwrap_or_else(|e| e.into_inner());
        queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The cross-thread face of a remote domain: its queue, its readiness
/// flag and its exported-objects table. Proxy objects hold a raw pointer
/// to one of these (reference-counted through `Arc`).
pub struct DomainHandleShared {
    pub queue: Arc<MessageQueue>,
    pub ready: Mutex<bool>,
    pub ready_cond: Condvar,
    pub closed: Mutex<bool>,
}

impl DomainHandleShared {
    pub fn new() -> Arc<Self> {
        Arc::new(DomainHandleShared {
            queue: MessageQueue::new(),
            ready: Mutex::new(false),
            ready_cond: Condvar::new(),
            closed: Mutex::new(false),
        })
    }

    pub fn mark_ready(&self) {
        *self.ready.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.ready_cond.notify_all();
    }

    pub fn mark_closed(&self) {
        *self.closed.lock().unwrap_or_else(|e| e.into_inner()) = true;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn wait_ready(&self) -> Result<(), RemotingError> {
        let guard = self.ready.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, result) = self
            .ready_cond
            .wait_timeout_while(guard, DOMAIN_TIMEOUT, |ready| !*ready)
            .unwrap_or_else(|e| e.into_inner());
        if result.timed_out() && !*guard {
            return Err(RemotingError::DomainNotReady);
        }
        Ok(())
    }
}

/// Host-side handle to a domain running on another thread.
pub struct DomainHandle {
    pub shared: Arc<DomainHandleShared>,
    pub thread: Option<std::thread::JoinHandle<bool>>,
}

impl DomainHandle {
    /// Sends a synchronous call and blocks until the response or the
    /// remote-call timeout. Calling after the target exited aborts the
    /// sender with a timeout-class error.
    pub fn send_sync(
        &self,
        target_name: &str,
        method: MethodId,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RemotingError> {
        send_sync_shared(&self.shared, target_name, method, payload)
    }

    pub fn join(mut self) -> bool {
        match self.thread.take() {
            Some(handle) => handle.join().unwrap_or(false),
            None => false,
        }
    }
}

pub fn send_sync_shared(
    shared: &DomainHandleShared,
    target_name: &str,
    method: MethodId,
    payload: Vec<u8>,
) -> Result<Vec<u8>, RemotingError> {
    if shared.is_closed() {
        return Err(RemotingError::Timeout);
    }
    let response = ResponseSlot::new();
    shared.queue.enqueue(DomainMessage {
        target_name: target_name.to_string(),
        method,
        payload,
        response: Arc::clone(&response),
    });
    response.wait(REMOTE_CALL_TIMEOUT)
}

// ---------------------------------------------------------------------------
// Class-driven serialisation
// ---------------------------------------------------------------------------

// Wire tags keep the format self-describing enough to validate.
const TAG_WORD: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_STRING: u8 = 3;
const TAG_NULL: u8 = 4;
const TAG_BLOB: u8 = 5;
const TAG_INTERFACE: u8 = 6;
const TAG_FOREIGN_NAME: u8 = 7;

/// Serialises one argument word. Primitives are copied in place; strings
/// are cloned; structs without references copy raw; foreign references
/// travel as exported-object names; interfaces go out prefixed with
/// their concrete nice name.
pub fn serialize_value(
    md: &Metadata,
    ty: &TypeRef,
    word: usize,
    out: &mut Vec<u8>,
) -> Result<(), RemotingError> {
    if ty.array_level > 0 {
        return Err(RemotingError::Unserializable(ty.to_string()));
    }
    if ty.kind == TypeRefKind::Foreign {
        // The payload is the exported name the proxy carries.
        let name_obj = word as *const u8;
        let name = unsafe { crate::strings::read_string(name_obj) };
        out.push(TAG_FOREIGN_NAME);
        write_str(out, &name);
        return Ok(());
    }
    match ty.prim {
        PrimType::Int | PrimType::Bool | PrimType::Char | PrimType::IntPtr => {
            out.push(TAG_WORD);
            out.extend_from_slice(&(word as u32).to_le_bytes());
            Ok(())
        }
        PrimType::Float => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&(word as u32).to_le_bytes());
            Ok(())
        }
        PrimType::Object => {
            let Some(class_id) = ty.resolved else {
                return Err(RemotingError::Unserializable(ty.to_string()));
            };
            let class = md.class(class_id);
            if class.flat_name == "string" {
                if word == 0 {
                    out.push(TAG_NULL);
                    return Ok(());
                }
                let text = unsafe { crate::strings::read_string(word as *const u8) };
                out.push(TAG_STRING);
                write_str(out, &text);
                return Ok(());
            }
            if class.is_value_type {
                if !class.gc_info.gc_map.is_empty() {
                    return Err(RemotingError::Unserializable(class.nice_name.clone()));
                }
                out.push(TAG_BLOB);
                let size = class.gc_info.content_size as usize;
                out.extend_from_slice(&(size as u32).to_le_bytes());
                // For word-sized structs the word IS the payload.
                if size <= std::mem::size_of::<usize>() {
                    out.extend_from_slice(&word.to_le_bytes()[..size]);
                } else {
                    let bytes = unsafe {
                        std::slice::from_raw_parts(word as *const u8, size)
                    };
                    out.extend_from_slice(bytes);
                }
                return Ok(());
            }
            if class.special == SpecialClass::Interface || class.is_hierarchy_root {
                if word == 0 {
                    out.push(TAG_NULL);
                    return Ok(());
                }
                // Prefix with the concrete nice name so the receiving
                // domain can resolve its own class.
                let concrete = unsafe { crate::gc::MemoryManager::class_of(word as *mut u8) };
                out.push(TAG_INTERFACE);
                write_str(out, &md.class(concrete).nice_name);
                let mut inner = md
                    .class(concrete)
                    .wrapped
                    .clone()
                    .unwrap_or_else(|| TypeRef::object(md.class(concrete).flat_name.clone()));
                inner.resolved = inner.resolved.or(Some(concrete));
                return serialize_value(md, &inner, word, out);
            }
            Err(RemotingError::Unserializable(class.nice_name.clone()))
        }
        PrimType::Void => Err(RemotingError::Unserializable("void".to_string())),
    }
}

/// The decoded form of a wire value, ready for the receiving domain to
/// materialise (strings and enums need its heap).
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Word(u32),
    Float(f32),
    Str(String),
    Null,
    Blob(Vec<u8>),
    Interface { nice_name: String, value: Box<WireValue> },
    ForeignName(String),
}

pub fn deserialize_value(input: &mut &[u8]) -> Result<WireValue, RemotingError> {
    let (&tag, rest) = input.split_first().ok_or(RemotingError::Format)?;
    *input = rest;
    Ok(match tag {
        TAG_WORD => WireValue::Word(read_u32(input)?),
        TAG_FLOAT => WireValue::Float(f32::from_le_bytes(read_u32(input)?.to_le_bytes())),
        TAG_STRING => WireValue::Str(read_str(input)?),
        TAG_NULL => WireValue::Null,
        TAG_BLOB => {
            let size = read_u32(input)? as usize;
            if input.len() < size {
                return Err(RemotingError::Format);
            }
            let (bytes, rest) = input.split_at(size);
            *input = rest;
            WireValue::Blob(bytes.to_vec())
        }
        TAG_INTERFACE => {
            let nice_name = read_str(input)?;
            let value = deserialize_value(input)?;
            WireValue::Interface {
                nice_name,
                value: Box::new(value),
            }
        }
        TAG_FOREIGN_NAME => WireValue::ForeignName(read_str(input)?),
        _ => return Err(RemotingError::Format),
    })
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn read_u32(input: &mut &[u8]) -> Result<u32, RemotingError> {
    if input.len() < 4 {
        return Err(RemotingError::Format);
    }
    let (bytes, rest) = input.split_at(4);
    *input = rest;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_str(input: &mut &[u8]) -> Result<String, RemotingError> {
    let len = read_u32(input)? as usize;
    if input.len() < len {
        return Err(RemotingError::Format);
    }
    let (bytes, rest) = input.split_at(len);
    *input = rest;
    String::from_utf8(bytes.to_vec()).map_err(|_| RemotingError::Format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skizo_metadata::Class;

    #[test]
    fn test_primitive_round_trip() {
        let md = Metadata::new();
        let mut buffer = Vec::new();
        let mut int_ty = TypeRef::int();
        int_ty.resolved = None;
        serialize_value(&md, &int_ty, 42, &mut buffer).unwrap();
        serialize_value(&md, &TypeRef::float(), f32::to_bits(1.5) as usize, &mut buffer)
            .unwrap();
        serialize_value(&md, &TypeRef::bool_(), 1, &mut buffer).unwrap();

        let mut cursor = buffer.as_slice();
        assert_eq!(deserialize_value(&mut cursor).unwrap(), WireValue::Word(42));
        assert_eq!(
            deserialize_value(&mut cursor).unwrap(),
            WireValue::Float(1.5)
        );
        assert_eq!(deserialize_value(&mut cursor).unwrap(), WireValue::Word(1));
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_struct_without_refs_round_trips() {
        let mut md = Metadata::new();
        let id = md.next_class_id();
        let mut v = Class::new(id, "Pair");
        v.is_value_type = true;
        v.gc_info.content_size = 8;
        v.gc_info.size_for_use = 8;
        let id = md.register_class(v).unwrap();

        let payload: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
        let mut ty = TypeRef::object("Pair");
        ty.resolved = Some(id);
        let mut buffer = Vec::new();
        serialize_value(&md, &ty, payload.as_ptr() as usize, &mut buffer).unwrap();

        let mut cursor = buffer.as_slice();
        assert_eq!(
            deserialize_value(&mut cursor).unwrap(),
            WireValue::Blob(payload.to_vec())
        );
    }

    #[test]
    fn test_struct_with_refs_rejected() {
        let mut md = Metadata::new();
        let id = md.next_class_id();
        let mut v = Class::new(id, "Holder");
        v.is_value_type = true;
        v.gc_info.content_size = 8;
        v.gc_info.gc_map = vec![0];
        let id = md.register_class(v).unwrap();

        let mut ty = TypeRef::object("Holder");
        ty.resolved = Some(id);
        let mut buffer = Vec::new();
        assert!(serialize_value(&md, &ty, 0, &mut buffer).is_err());
    }

    #[test]
    fn test_queue_poll_timeout() {
        let queue = MessageQueue::new();
        let started = std::time::Instant::now();
        assert!(queue.dequeue(Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_sync_handshake() {
        let shared = DomainHandleShared::new();
        shared.mark_ready();
        let server_shared = Arc::clone(&shared);

        let server = std::thread::spawn(move || {
            let message = server_shared
                .queue
                .dequeue(Duration::from_secs(1))
                .expect("message arrives");
            assert_eq!(message.target_name, "obj");
            message.response.complete(Ok(vec![9, 9]));
        });

        let result = send_sync_shared(&shared, "obj", MethodId(3), vec![1]).unwrap();
        assert_eq!(result, vec![9, 9]);
        server.join().unwrap();
    }

    #[test]
    fn test_sender_times_out_without_listener() {
        let shared = DomainHandleShared::new();
        shared.mark_ready();
        // Nobody listens; the sender must abort within the timeout.
        let started = std::time::Instant::now();
        let result = send_sync_shared(&shared, "obj", MethodId(0), vec![]);
        assert!(matches!(result, Err(RemotingError::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(1900));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_closed_handle_fails_fast() {
        let shared = DomainHandleShared::new();
        shared.mark_closed();
        assert!(matches!(
            send_sync_shared(&shared, "obj", MethodId(0), vec![]),
            Err(RemotingError::Timeout)
        ));
    }

    #[test]
    fn test_interface_prefixes_concrete_name() {
        // Interface values travel with the concrete nice name; verify the
        // wire shape with a hand-built buffer.
        let mut buffer = Vec::new();
        buffer.push(TAG_INTERFACE);
        write_str(&mut buffer, "Point");
        buffer.push(TAG_BLOB);
        buffer.extend_from_slice(&4u32.to_le_bytes());
        buffer.extend_from_slice(&[1, 2, 3, 4]);

        let mut cursor = buffer.as_slice();
        match deserialize_value(&mut cursor).unwrap() {
            WireValue::Interface { nice_name, value } => {
                assert_eq!(nice_name, "Point");
                assert_eq!(*value, WireValue::Blob(vec![1, 2, 3, 4]));
            }
            other => panic!("unexpected wire value: {:?}", other),
        }
    }
}
