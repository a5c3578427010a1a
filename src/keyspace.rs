//! The typed keyspace: strings, lists, streams, TTL, and the blocking list
//! and stream read operations built on top of them (spec §3, §4.2).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock};

use crate::entry::{now_ms, Entry, EntryData, StreamId, StreamRecord};
use crate::error::CommandError;
use crate::resp::Value;

/// Write commands that must be propagated to replicas (spec §4.3). Kept
/// here, next to the handlers, so the set can't drift from what's actually
/// a write.
pub const WRITE_COMMANDS: &[&str] = &[
    "SET", "DEL", "LPUSH", "RPUSH", "LPOP", "RPOP", "BLPOP", "INCR", "XADD", "MULTI", "EXEC",
    "DISCARD",
];

pub struct Keyspace {
    store: RwLock<HashMap<String, Entry>>,
    /// Per-key queues of waiter signals for BLPOP (spec §5: a push must
    /// wake a *matching* waiter, not an arbitrary one blocked on some
    /// other key). Each blocked call registers one `Arc<Notify>` per key
    /// it's interested in; a push pops the front of that key's queue and
    /// fires it, preserving FIFO order among waiters on the same key.
    blpop_waiters: RwLock<HashMap<String, VecDeque<Arc<Notify>>>>,
    /// Shared signal for XREAD BLOCK waiters; `notify_waiters` wakes every
    /// currently-blocked reader so each can recheck its own keys.
    xread_notify: Notify,
}

impl Keyspace {
    pub fn new() -> Arc<Self> {
        Arc::new(Keyspace {
            store: RwLock::new(HashMap::new()),
            blpop_waiters: RwLock::new(HashMap::new()),
            xread_notify: Notify::new(),
        })
    }

    /// Used by the RDB loader to seed the keyspace directly.
    pub async fn insert_raw(&self, key: String, entry: Entry) {
        self.store.write().await.insert(key, entry);
    }

    fn take_if_live(store: &mut HashMap<String, Entry>, key: &str) -> Option<Entry> {
        let expired = store.get(key).map(|e| e.is_expired()).unwrap_or(false);
        if expired {
            store.remove(key);
            return None;
        }
        store.remove(key)
    }

    fn peek_live<'a>(store: &'a HashMap<String, Entry>, key: &str) -> Option<&'a Entry> {
        match store.get(key) {
            Some(e) if e.is_expired() => None,
            other => other,
        }
    }

    pub fn ping(msg: Option<String>) -> Value {
        match msg {
            Some(m) => Value::bulk_str(m),
            None => Value::SimpleString("PONG".to_string()),
        }
    }

    pub fn echo(msg: String) -> Value {
        Value::bulk_str(msg)
    }

    pub async fn type_of(&self, key: &str) -> Value {
        let store = self.store.read().await;
        match Self::peek_live(&store, key) {
            Some(entry) => Value::SimpleString(entry.data.type_name().to_string()),
            None => Value::SimpleString("none".to_string()),
        }
    }

    pub async fn set(&self, key: String, value: Vec<u8>, px: Option<u64>) -> Value {
        let expires_at_ms = px.map(|ms| now_ms() + ms).unwrap_or(0);
        let mut store = self.store.write().await;
        store.insert(key, Entry::new_string(value, expires_at_ms));
        Value::ok()
    }

    pub async fn get(&self, key: &str) -> Result<Value, CommandError> {
        let mut store = self.store.write().await;
        let expired = store.get(key).map(|e| e.is_expired()).unwrap_or(false);
        if expired {
            store.remove(key);
            return Ok(Value::NullBulk);
        }
        match store.get(key) {
            None => Ok(Value::NullBulk),
            Some(entry) => match &entry.data {
                EntryData::String(s) => Ok(Value::Bulk(s.clone())),
                _ => Err(CommandError::WrongType),
            },
        }
    }

    pub async fn incr(&self, key: &str) -> Result<Value, CommandError> {
        let mut store = self.store.write().await;
        if let Some(e) = store.get(key) {
            if e.is_expired() {
                store.remove(key);
            }
        }
        let entry = store.get_mut(key).ok_or(CommandError::NoSuchKey)?;
        let EntryData::String(bytes) = &entry.data else {
            return Err(CommandError::WrongType);
        };
        let current: i64 = std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(CommandError::NotAnInteger)?;
        let next = current.checked_add(1).ok_or(CommandError::NotAnInteger)?;
        entry.data = EntryData::String(next.to_string().into_bytes());
        Ok(Value::Integer(next))
    }

    pub async fn del(&self, keys: &[String]) -> i64 {
        let mut store = self.store.write().await;
        let mut count = 0i64;
        for key in keys {
            if Self::take_if_live(&mut store, key).is_some() {
                count += 1;
            }
        }
        count
    }

    pub async fn exists(&self, keys: &[String]) -> i64 {
        let store = self.store.read().await;
        keys.iter()
            .filter(|k| Self::peek_live(&store, k).is_some())
            .count() as i64
    }

    pub async fn keys(&self) -> Value {
        let store = self.store.read().await;
        let live: Vec<String> = store
            .iter()
            .filter(|(_, e)| !e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        Value::array_of_bulks(live)
    }

    async fn push(&self, key: String, values: Vec<Vec<u8>>, front: bool) -> Result<Value, CommandError> {
        let key_for_wake = key.clone();
        let new_len = {
            let mut store = self.store.write().await;
            if let Some(e) = store.get(&key) {
                if e.is_expired() {
                    store.remove(&key);
                }
            }
            let entry = store
                .entry(key)
                .or_insert_with(|| Entry::new(EntryData::List(VecDeque::new()), 0));
            let EntryData::List(list) = &mut entry.data else {
                return Err(CommandError::WrongType);
            };
            for value in values {
                if front {
                    list.push_front(value);
                } else {
                    list.push_back(value);
                }
            }
            list.len()
        };
        self.wake_blpop_waiter(&key_for_wake).await;
        Ok(Value::Integer(new_len as i64))
    }

    /// Wakes the single longest-waiting BLPOP call registered on `key`, if
    /// any (spec §5 FIFO-per-key contract).
    async fn wake_blpop_waiter(&self, key: &str) {
        let mut waiters = self.blpop_waiters.write().await;
        if let Some(queue) = waiters.get_mut(key) {
            if let Some(notify) = queue.pop_front() {
                notify.notify_one();
            }
            if queue.is_empty() {
                waiters.remove(key);
            }
        }
    }

    async fn register_blpop_waiter(&self, keys: &[String], notify: &Arc<Notify>) {
        let mut waiters = self.blpop_waiters.write().await;
        for key in keys {
            waiters.entry(key.clone()).or_default().push_back(notify.clone());
        }
    }

    async fn deregister_blpop_waiter(&self, keys: &[String], notify: &Arc<Notify>) {
        let mut waiters = self.blpop_waiters.write().await;
        for key in keys {
            if let Some(queue) = waiters.get_mut(key) {
                queue.retain(|n| !Arc::ptr_eq(n, notify));
                if queue.is_empty() {
                    waiters.remove(key);
                }
            }
        }
    }

    pub async fn lpush(&self, key: String, values: Vec<Vec<u8>>) -> Result<Value, CommandError> {
        self.push(key, values, true).await
    }

    pub async fn rpush(&self, key: String, values: Vec<Vec<u8>>) -> Result<Value, CommandError> {
        self.push(key, values, false).await
    }

    pub async fn llen(&self, key: &str) -> Result<Value, CommandError> {
        let store = self.store.read().await;
        match Self::peek_live(&store, key) {
            None => Ok(Value::Integer(0)),
            Some(entry) => match &entry.data {
                EntryData::List(list) => Ok(Value::Integer(list.len() as i64)),
                _ => Err(CommandError::WrongType),
            },
        }
    }

    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Value, CommandError> {
        let store = self.store.read().await;
        let list = match Self::peek_live(&store, key) {
            None => return Ok(Value::Array(Vec::new())),
            Some(entry) => match &entry.data {
                EntryData::List(list) => list,
                _ => return Err(CommandError::WrongType),
            },
        };
        let len = list.len() as i64;
        if len == 0 {
            return Ok(Value::Array(Vec::new()));
        }
        let norm = |i: i64| if i < 0 { len + i } else { i };
        let start = norm(start).max(0);
        let stop = norm(stop).min(len - 1);
        if start > stop {
            return Ok(Value::Array(Vec::new()));
        }
        let items: Vec<Value> = list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .map(|v| Value::Bulk(v.clone()))
            .collect();
        Ok(Value::Array(items))
    }

    fn pop_n(list: &mut VecDeque<Vec<u8>>, count: usize, front: bool) -> Vec<Vec<u8>> {
        let n = count.min(list.len());
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let v = if front { list.pop_front() } else { list.pop_back() };
            if let Some(v) = v {
                out.push(v);
            }
        }
        out
    }

    async fn pop(&self, key: &str, count: Option<i64>, front: bool) -> Result<Value, CommandError> {
        let mut store = self.store.write().await;
        if let Some(e) = store.get(key) {
            if e.is_expired() {
                store.remove(key);
            }
        }
        let Some(entry) = store.get_mut(key) else {
            return Ok(match count {
                None => Value::NullBulk,
                Some(_) => Value::Array(Vec::new()),
            });
        };
        let EntryData::List(list) = &mut entry.data else {
            return Err(CommandError::WrongType);
        };
        let result = match count {
            None => match if front { list.pop_front() } else { list.pop_back() } {
                Some(v) => Value::Bulk(v),
                None => Value::NullBulk,
            },
            Some(n) => {
                if n < 0 {
                    return Err(CommandError::NotAnInteger);
                }
                let popped = Self::pop_n(list, n as usize, front);
                if n == 1 {
                    Value::Bulk(popped.into_iter().next().unwrap())
                } else {
                    Value::Array(popped.into_iter().map(Value::Bulk).collect())
                }
            }
        };
        if list.is_empty() {
            store.remove(key);
        }
        Ok(result)
    }

    pub async fn lpop(&self, key: &str, count: Option<i64>) -> Result<Value, CommandError> {
        self.pop(key, count, true).await
    }

    pub async fn rpop(&self, key: &str, count: Option<i64>) -> Result<Value, CommandError> {
        self.pop(key, count, false).await
    }

    /// Scans `keys` left to right, popping the head of the first non-empty
    /// list under a single lock acquisition. Returns `None` if every key is
    /// empty or absent.
    async fn try_blpop(&self, keys: &[String]) -> Option<Value> {
        let mut store = self.store.write().await;
        for key in keys {
            if let Some(e) = store.get(key) {
                if e.is_expired() {
                    store.remove(key);
                    continue;
                }
            }
            if let Some(entry) = store.get_mut(key) {
                if let EntryData::List(list) = &mut entry.data {
                    if let Some(value) = list.pop_front() {
                        if list.is_empty() {
                            store.remove(key);
                        }
                        return Some(Value::Array(vec![Value::bulk_str(key.clone()), Value::Bulk(value)]));
                    }
                }
            }
        }
        None
    }

    /// BLPOP: spec §4.2, §5. `timeout` of zero blocks indefinitely.
    pub async fn blpop(&self, keys: &[String], timeout: Duration) -> Value {
        let deadline = if timeout.is_zero() {
            None
        } else {
            Some(tokio::time::Instant::now() + timeout)
        };
        // One signal per call, registered under every key it's blocking
        // on, so a push only ever wakes a waiter actually interested in
        // that key (spec §5).
        let my_notify = Arc::new(Notify::new());
        let result = loop {
            // Register before checking, so a push racing the check can't
            // be missed between the check and the await below.
            self.register_blpop_waiter(keys, &my_notify).await;
            if let Some(v) = self.try_blpop(keys).await {
                break v;
            }
            let notified = my_notify.notified();
            match deadline {
                None => notified.await,
                Some(dl) => {
                    if tokio::time::timeout_at(dl, notified).await.is_err() {
                        break Value::NullArray;
                    }
                }
            }
            self.deregister_blpop_waiter(keys, &my_notify).await;
        };
        self.deregister_blpop_waiter(keys, &my_notify).await;
        result
    }

    pub async fn last_stream_id(&self, key: &str) -> StreamId {
        let store = self.store.read().await;
        match Self::peek_live(&store, key) {
            Some(Entry { data: EntryData::Stream(records), .. }) => {
                records.last().map(|r| r.id).unwrap_or(StreamId::ZERO)
            }
            _ => StreamId::ZERO,
        }
    }

    /// XADD: spec §4.2. `id_spec` is one of `*`, `ms-*`, or `ms-seq`.
    pub async fn xadd(
        &self,
        key: String,
        id_spec: &str,
        fields: Vec<(String, String)>,
    ) -> Result<Value, CommandError> {
        let mut store = self.store.write().await;
        if let Some(e) = store.get(&key) {
            if e.is_expired() {
                store.remove(&key);
            }
        }
        let entry = store
            .entry(key)
            .or_insert_with(|| Entry::new(EntryData::Stream(Vec::new()), 0));
        let EntryData::Stream(records) = &mut entry.data else {
            return Err(CommandError::WrongType);
        };
        let last_id = records.last().map(|r| r.id).unwrap_or(StreamId::ZERO);
        let new_id = Self::resolve_stream_id(id_spec, last_id)?;
        if new_id <= StreamId::ZERO {
            return Err(CommandError::StreamIdTooSmall);
        }
        if new_id <= last_id {
            return Err(CommandError::StreamIdNotMonotonic);
        }
        records.push(StreamRecord { id: new_id, fields });
        self.xread_notify.notify_waiters();
        Ok(Value::bulk_str(new_id.to_string()))
    }

    fn resolve_stream_id(id_spec: &str, last_id: StreamId) -> Result<StreamId, CommandError> {
        if id_spec == "*" {
            let ms = now_ms();
            let seq = if ms == last_id.ms { last_id.seq + 1 } else { 0 };
            return Ok(StreamId::new(ms, seq));
        }
        let (ms_part, seq_part) = id_spec
            .split_once('-')
            .ok_or_else(|| CommandError::generic("Invalid stream ID specified as stream command argument"))?;
        let ms: u64 = ms_part
            .parse()
            .map_err(|_| CommandError::generic("Invalid stream ID specified as stream command argument"))?;
        if seq_part == "*" {
            let seq = if ms == last_id.ms { last_id.seq + 1 } else { 0 };
            return Ok(StreamId::new(ms, seq));
        }
        let seq: u64 = seq_part
            .parse()
            .map_err(|_| CommandError::generic("Invalid stream ID specified as stream command argument"))?;
        Ok(StreamId::new(ms, seq))
    }

    fn parse_range_bound(token: &str, is_start: bool) -> Result<StreamId, CommandError> {
        if token == "-" {
            return Ok(StreamId::ZERO);
        }
        if token == "+" {
            return Ok(StreamId::MAX);
        }
        if let Some((ms, seq)) = token.split_once('-') {
            let ms: u64 = ms.parse().map_err(|_| CommandError::generic("Invalid stream ID specified as stream command argument"))?;
            let seq: u64 = seq.parse().map_err(|_| CommandError::generic("Invalid stream ID specified as stream command argument"))?;
            Ok(StreamId::new(ms, seq))
        } else {
            let ms: u64 = token.parse().map_err(|_| CommandError::generic("Invalid stream ID specified as stream command argument"))?;
            Ok(StreamId::new(ms, if is_start { 0 } else { u64::MAX }))
        }
    }

    fn encode_stream_record(record: &StreamRecord) -> Value {
        let mut fields = Vec::with_capacity(record.fields.len() * 2);
        for (k, v) in &record.fields {
            fields.push(Value::bulk_str(k.clone()));
            fields.push(Value::bulk_str(v.clone()));
        }
        Value::Array(vec![Value::bulk_str(record.id.to_string()), Value::Array(fields)])
    }

    pub async fn xrange(&self, key: &str, start: &str, end: &str) -> Result<Value, CommandError> {
        let start_id = Self::parse_range_bound(start, true)?;
        let end_id = Self::parse_range_bound(end, false)?;
        let store = self.store.read().await;
        let records = match Self::peek_live(&store, key) {
            None => return Ok(Value::Array(Vec::new())),
            Some(entry) => match &entry.data {
                EntryData::Stream(records) => records,
                _ => return Err(CommandError::WrongType),
            },
        };
        let items: Vec<Value> = records
            .iter()
            .filter(|r| r.id >= start_id && r.id <= end_id)
            .map(Self::encode_stream_record)
            .collect();
        Ok(Value::Array(items))
    }

    async fn xread_once(&self, keys: &[String], after: &[StreamId]) -> Option<Value> {
        let store = self.store.read().await;
        let mut per_key = Vec::new();
        for (key, after_id) in keys.iter().zip(after.iter()) {
            let Some(entry) = Self::peek_live(&store, key) else {
                continue;
            };
            let EntryData::Stream(records) = &entry.data else {
                continue;
            };
            let matching: Vec<Value> = records
                .iter()
                .filter(|r| r.id > *after_id)
                .map(Self::encode_stream_record)
                .collect();
            if !matching.is_empty() {
                per_key.push(Value::Array(vec![Value::bulk_str(key.clone()), Value::Array(matching)]));
            }
        }
        if per_key.is_empty() {
            None
        } else {
            Some(Value::Array(per_key))
        }
    }

    /// Resolves the `$` sentinel id (spec §4.2: "current last id of that
    /// key at call time") before any blocking wait begins.
    pub async fn resolve_xread_id(&self, key: &str, id_token: &str) -> Result<StreamId, CommandError> {
        if id_token == "$" {
            Ok(self.last_stream_id(key).await)
        } else {
            Self::parse_range_bound(id_token, false)
        }
    }

    /// XREAD: spec §4.2. `block` is `None` for a non-blocking read, or
    /// `Some(0)` to block indefinitely, `Some(ms)` otherwise.
    pub async fn xread(&self, keys: &[String], after: &[StreamId], block: Option<u64>) -> Value {
        match block {
            None => self.xread_once(keys, after).await.unwrap_or(Value::NullArray),
            Some(ms) => {
                let deadline = if ms == 0 {
                    None
                } else {
                    Some(tokio::time::Instant::now() + Duration::from_millis(ms))
                };
                loop {
                    let notified = self.xread_notify.notified();
                    if let Some(v) = self.xread_once(keys, after).await {
                        return v;
                    }
                    match deadline {
                        None => notified.await,
                        Some(dl) => {
                            if tokio::time::timeout_at(dl, notified).await.is_err() {
                                return Value::NullArray;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_type_roundtrip() {
        let ks = Keyspace::new();
        ks.set("foo".into(), b"bar".to_vec(), None).await;
        assert_eq!(ks.get("foo").await.unwrap(), Value::Bulk(b"bar".to_vec()));
        assert_eq!(ks.type_of("foo").await, Value::SimpleString("string".into()));
        assert_eq!(ks.type_of("missing").await, Value::SimpleString("none".into()));
    }

    #[tokio::test]
    async fn get_on_list_is_wrongtype() {
        let ks = Keyspace::new();
        ks.rpush("l".into(), vec![b"a".to_vec()]).await.unwrap();
        assert!(matches!(ks.get("l").await, Err(CommandError::WrongType)));
    }

    #[tokio::test]
    async fn incr_requires_existing_key() {
        let ks = Keyspace::new();
        assert!(matches!(ks.incr("missing").await, Err(CommandError::NoSuchKey)));
        ks.set("n".into(), b"1".to_vec(), None).await;
        assert_eq!(ks.incr("n").await.unwrap(), Value::Integer(2));
    }

    #[tokio::test]
    async fn incr_rejects_non_numeric() {
        let ks = Keyspace::new();
        ks.set("n".into(), b"abc".to_vec(), None).await;
        assert!(matches!(ks.incr("n").await, Err(CommandError::NotAnInteger)));
    }

    #[tokio::test]
    async fn lpush_prepends_in_argument_order() {
        let ks = Keyspace::new();
        ks.lpush("l".into(), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()])
            .await
            .unwrap();
        // last listed value ends up at the head
        let got = ks.lrange("l", 0, -1).await.unwrap();
        assert_eq!(
            got,
            Value::Array(vec![Value::Bulk(b"c".to_vec()), Value::Bulk(b"b".to_vec()), Value::Bulk(b"a".to_vec())])
        );
    }

    #[tokio::test]
    async fn lrange_and_llen_and_lpop_count() {
        let ks = Keyspace::new();
        ks.rpush("L".into(), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()])
            .await
            .unwrap();
        assert_eq!(ks.llen("L").await.unwrap(), Value::Integer(3));
        let range = ks.lrange("L", 0, -1).await.unwrap();
        assert_eq!(
            range,
            Value::Array(vec![Value::Bulk(b"a".to_vec()), Value::Bulk(b"b".to_vec()), Value::Bulk(b"c".to_vec())])
        );
        let popped = ks.lpop("L", Some(2)).await.unwrap();
        assert_eq!(popped, Value::Array(vec![Value::Bulk(b"a".to_vec()), Value::Bulk(b"b".to_vec())]));
        assert_eq!(ks.llen("L").await.unwrap(), Value::Integer(1));
    }

    #[tokio::test]
    async fn lpop_count_one_returns_bare_bulk() {
        let ks = Keyspace::new();
        ks.rpush("L".into(), vec![b"a".to_vec(), b"b".to_vec()]).await.unwrap();
        let popped = ks.lpop("L", Some(1)).await.unwrap();
        assert_eq!(popped, Value::Bulk(b"a".to_vec()));
    }

    #[tokio::test]
    async fn lpop_count_two_on_single_element_list_is_still_an_array() {
        // The bare-bulk-vs-array choice is keyed on the *requested* count,
        // not on how many elements actually came back.
        let ks = Keyspace::new();
        ks.rpush("L".into(), vec![b"a".to_vec()]).await.unwrap();
        let popped = ks.lpop("L", Some(2)).await.unwrap();
        assert_eq!(popped, Value::Array(vec![Value::Bulk(b"a".to_vec())]));
    }

    #[tokio::test]
    async fn blpop_returns_immediately_when_list_nonempty() {
        let ks = Keyspace::new();
        ks.rpush("L".into(), vec![b"x".to_vec()]).await.unwrap();
        let result = ks.blpop(&["L".to_string()], Duration::from_secs(0)).await;
        // this would block forever if the list were empty; since it's
        // nonempty the call must return without needing any push.
        assert_eq!(result, Value::Array(vec![Value::bulk_str("L"), Value::Bulk(b"x".to_vec())]));
    }

    #[tokio::test]
    async fn blpop_wakes_on_concurrent_push() {
        let ks = Keyspace::new();
        let keys = vec!["L".to_string()];
        let ks_clone = ks.clone();
        let handle = tokio::spawn(async move { ks_clone.blpop(&keys, Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        ks.rpush("L".into(), vec![b"pushed".to_vec()]).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(result, Value::Array(vec![Value::bulk_str("L"), Value::Bulk(b"pushed".to_vec())]));
        assert_eq!(ks.llen("L").await.unwrap(), Value::Integer(0));
    }

    #[tokio::test]
    async fn blpop_push_on_other_key_does_not_steal_the_wakeup() {
        // Two callers block on different keys; a push to the key nobody
        // is actually waiting on must not consume the wakeup owed to the
        // waiter on the other key.
        let ks = Keyspace::new();
        let ks_a = ks.clone();
        let ks_b = ks.clone();
        let handle_a = tokio::spawn(async move { ks_a.blpop(&["A".to_string()], Duration::from_secs(5)).await });
        let handle_b = tokio::spawn(async move { ks_b.blpop(&["B".to_string()], Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        ks.rpush("B".into(), vec![b"for-b".to_vec()]).await.unwrap();
        let result_b = tokio::time::timeout(Duration::from_secs(2), handle_b).await.unwrap().unwrap();
        assert_eq!(result_b, Value::Array(vec![Value::bulk_str("B"), Value::Bulk(b"for-b".to_vec())]));

        ks.rpush("A".into(), vec![b"for-a".to_vec()]).await.unwrap();
        let result_a = tokio::time::timeout(Duration::from_secs(2), handle_a).await.unwrap().unwrap();
        assert_eq!(result_a, Value::Array(vec![Value::bulk_str("A"), Value::Bulk(b"for-a".to_vec())]));
    }

    #[tokio::test]
    async fn blpop_times_out_to_null_array() {
        let ks = Keyspace::new();
        let result = ks.blpop(&["missing".to_string()], Duration::from_millis(50)).await;
        assert_eq!(result, Value::NullArray);
    }

    #[tokio::test]
    async fn xadd_enforces_monotonic_ids() {
        let ks = Keyspace::new();
        let id = ks.xadd("S".into(), "1-1", vec![("k".into(), "v".into())]).await.unwrap();
        assert_eq!(id, Value::bulk_str("1-1"));
        let err = ks.xadd("S".into(), "1-1", vec![("k".into(), "v".into())]).await.unwrap_err();
        assert!(matches!(err, CommandError::StreamIdNotMonotonic));
        let err = ks.xadd("S".into(), "0-0", vec![("k".into(), "v".into())]).await.unwrap_err();
        assert!(matches!(err, CommandError::StreamIdTooSmall));
    }

    #[tokio::test]
    async fn xadd_auto_sequence() {
        let ks = Keyspace::new();
        ks.xadd("S".into(), "5-*", vec![("a".into(), "1".into())]).await.unwrap();
        let id2 = ks.xadd("S".into(), "5-*", vec![("a".into(), "2".into())]).await.unwrap();
        assert_eq!(id2, Value::bulk_str("5-1"));
    }

    #[tokio::test]
    async fn xrange_filters_inclusive_bounds() {
        let ks = Keyspace::new();
        ks.xadd("S".into(), "1-1", vec![("a".into(), "1".into())]).await.unwrap();
        ks.xadd("S".into(), "2-1", vec![("a".into(), "2".into())]).await.unwrap();
        ks.xadd("S".into(), "3-1", vec![("a".into(), "3".into())]).await.unwrap();
        let result = ks.xrange("S", "2-1", "+").await.unwrap();
        let Value::Array(items) = result else { panic!("expected array") };
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn xread_blocks_until_xadd() {
        let ks = Keyspace::new();
        let after = vec![StreamId::ZERO];
        let ks_clone = ks.clone();
        let keys = vec!["S".to_string()];
        let handle = tokio::spawn(async move { ks_clone.xread(&keys, &after, Some(5000)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        ks.xadd("S".into(), "1-1", vec![("a".into(), "1".into())]).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_ne!(result, Value::NullArray);
    }

    #[tokio::test]
    async fn del_and_exists_count_only_live_keys() {
        let ks = Keyspace::new();
        ks.set("a".into(), b"1".to_vec(), None).await;
        assert_eq!(ks.exists(&["a".to_string(), "missing".to_string()]).await, 1);
        assert_eq!(ks.del(&["a".to_string()]).await, 1);
        assert_eq!(ks.exists(&["a".to_string()]).await, 0);
    }

    #[tokio::test]
    async fn expired_entry_is_treated_as_absent() {
        let ks = Keyspace::new();
        ks.set("a".into(), b"1".to_vec(), Some(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ks.get("a").await.unwrap(), Value::NullBulk);
        assert_eq!(ks.exists(&["a".to_string()]).await, 0);
    }
}
