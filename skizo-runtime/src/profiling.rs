//! Per-method call profiling, active when the domain runs with
//! `ProfilingEnabled`. Frames are timed on push/pop; reports sort by
//! total time, average time or call count and dump to the console or to
//! disk as JSON.

use serde::Serialize;
use skizo_metadata::{Metadata, MethodId};
use std::collections::HashMap;
use std::io::Write;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileSort {
    TotalTime,
    AverageTime,
    CallCount,
}

#[derive(Debug, Default, Clone)]
struct Entry {
    calls: u64,
    total_ns: u128,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProfileRecord {
    pub method: String,
    pub calls: u64,
    pub total_ms: f64,
    pub average_ms: f64,
}

#[derive(Default)]
pub struct Profiler {
    entries: HashMap<MethodId, Entry>,
    stack: Vec<(MethodId, Instant)>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, method: MethodId) {
        self.stack.push((method, Instant::now()));
    }

    pub fn pop(&mut self, method: MethodId) {
        // Unwinds may skip frames; drop until the matching one is found.
        while let Some((mid, started)) = self.stack.pop() {
            let entry = self.entries.entry(mid).or_default();
            entry.calls += 1;
            entry.total_ns += started.elapsed().as_nanos();
            if mid == method {
                break;
            }
        }
    }

    pub fn records(&self, md: &Metadata, sort: ProfileSort) -> Vec<ProfileRecord> {
        let mut records: Vec<ProfileRecord> = self
            .entries
            .iter()
            .map(|(&mid, entry)| {
                let total_ms = entry.total_ns as f64 / 1_000_000.0;
                ProfileRecord {
                    method: md.method_full_name(mid),
                    calls: entry.calls,
                    total_ms,
                    average_ms: if entry.calls > 0 {
                        total_ms / entry.calls as f64
                    } else {
                        0.0
                    },
                }
            })
            .collect();
        match sort {
            ProfileSort::TotalTime => {
                records.sort_by(|a, b| b.total_ms.total_cmp(&a.total_ms))
            }
            ProfileSort::AverageTime => {
                records.sort_by(|a, b| b.average_ms.total_cmp(&a.average_ms))
            }
            ProfileSort::CallCount => records.sort_by(|a, b| b.calls.cmp(&a.calls)),
        }
        records
    }

    pub fn dump_to_console(&self, md: &Metadata, sort: ProfileSort) {
        for record in self.records(md, sort) {
            println!(
                "{:<40} calls: {:<8} total: {:.3}ms avg: {:.5}ms",
                record.method, record.calls, record.total_ms, record.average_ms
            );
        }
    }

    pub fn dump_to_disk(
        &self,
        md: &Metadata,
        sort: ProfileSort,
        path: &std::path::Path,
    ) -> std::io::Result<()> {
        let records = self.records(md, sort);
        let json = serde_json::to_string_pretty(&records)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let mut file = std::fs::File::create(path)?;
        file.write_all(json.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skizo_metadata::{Class, ClassId, Method, MethodKind};

    fn md_with_method(name: &str) -> (Metadata, MethodId) {
        let mut md = Metadata::new();
        let cid = md.next_class_id();
        md.register_class(Class::new(cid, "A")).unwrap();
        let mid = md.next_method_id();
        let m = Method::new(mid, cid, MethodKind::Normal, name.to_string());
        let mid = md.add_method(m);
        (md, mid)
    }

    #[test]
    fn test_push_pop_counts() {
        let (md, mid) = md_with_method("run");
        let mut profiler = Profiler::new();
        for _ in 0..3 {
            profiler.push(mid);
            profiler.pop(mid);
        }
        let records = profiler.records(&md, ProfileSort::CallCount);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].calls, 3);
        assert_eq!(records[0].method, "A::run");
    }

    #[test]
    fn test_unwound_frames_are_drained() {
        let (md, outer) = md_with_method("outer");
        let mut md = md;
        let cid = md.class_by_flat_name("A").unwrap();
        let inner_id = md.next_method_id();
        let inner = md.add_method(Method::new(inner_id, cid, MethodKind::Normal, "inner".into()));

        let mut profiler = Profiler::new();
        profiler.push(outer);
        profiler.push(inner);
        // An abort unwound past `inner`; popping outer drains both.
        profiler.pop(outer);
        let records = profiler.records(&md, ProfileSort::CallCount);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_json_dump() {
        let (md, mid) = md_with_method("run");
        let mut profiler = Profiler::new();
        profiler.push(mid);
        profiler.pop(mid);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        profiler
            .dump_to_disk(&md, ProfileSort::TotalTime, &path)
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("A::run"));
    }
}
