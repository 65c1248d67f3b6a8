//! Reading a version's content back out of its segments.

use crate::models::object::StorageRef;
use crate::services::backend::{ByteBackend, ByteRange, ByteStream};
use futures::{StreamExt, TryStreamExt, stream};
use std::{io, sync::Arc};

/// Map an object-level range onto the segments it touches. `None` as the
/// per-segment range means the whole segment.
pub fn plan_reads(storage_ref: &StorageRef, range: Option<ByteRange>) -> Vec<(String, Option<ByteRange>)> {
    let mut plan = Vec::new();
    let mut offset: u64 = 0;
    for segment in &storage_ref.segments {
        let size = u64::try_from(segment.size).unwrap_or(0);
        if size == 0 {
            continue;
        }
        let seg_start = offset;
        let seg_end = offset + size - 1;
        offset += size;

        let Some(range) = range else {
            plan.push((segment.reference.clone(), None));
            continue;
        };
        if range.end < seg_start || range.start > seg_end {
            continue;
        }
        let start = range.start.max(seg_start) - seg_start;
        let end = range.end.min(seg_end) - seg_start;
        let local = if start == 0 && end == size - 1 {
            None
        } else {
            Some(ByteRange { start, end })
        };
        plan.push((segment.reference.clone(), local));
    }
    plan
}

/// Open the first segment eagerly so a missing blob surfaces before any
/// response headers are sent. Later segments are opened only when the one
/// before them is exhausted.
pub async fn open_content_checked(
    backend: Arc<dyn ByteBackend>,
    storage_ref: &StorageRef,
    range: Option<ByteRange>,
) -> io::Result<ByteStream> {
    let mut plan = plan_reads(storage_ref, range).into_iter();
    let Some((first_ref, first_range)) = plan.next() else {
        return Ok(stream::empty().boxed());
    };
    let first = backend.get(&first_ref, first_range).await?;
    let rest: Vec<_> = plan.collect();
    let tail = stream::iter(rest)
        .then(move |(reference, local)| {
            let backend = backend.clone();
            async move { backend.get(&reference, local).await }
        })
        .try_flatten();
    Ok(first.chain(tail).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::object::Segment;
    use crate::services::backend::{FsBackend, collect_stream, stream_of};
    use tempfile::TempDir;

    fn three_segments() -> StorageRef {
        StorageRef {
            segments: vec![
                Segment { reference: "a".into(), size: 4 },
                Segment { reference: "b".into(), size: 4 },
                Segment { reference: "c".into(), size: 2 },
            ],
        }
    }

    #[test]
    fn range_spanning_segments_is_split() {
        let plan = plan_reads(&three_segments(), Some(ByteRange { start: 2, end: 8 }));
        assert_eq!(
            plan,
            vec![
                ("a".to_string(), Some(ByteRange { start: 2, end: 3 })),
                ("b".to_string(), None),
                ("c".to_string(), Some(ByteRange { start: 0, end: 0 })),
            ]
        );
    }

    #[test]
    fn full_read_touches_every_segment() {
        let plan = plan_reads(&three_segments(), None);
        assert_eq!(plan.len(), 3);
        assert!(plan.iter().all(|(_, r)| r.is_none()));
    }

    #[tokio::test]
    async fn concatenates_blobs_in_order() {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn ByteBackend> = Arc::new(FsBackend::new(dir.path()));
        let first = backend.put(stream_of(b"hello ", 2)).await.unwrap();
        let second = backend.put(stream_of(b"world", 2)).await.unwrap();
        let storage_ref = StorageRef {
            segments: vec![
                Segment { reference: first.reference, size: first.size },
                Segment { reference: second.reference, size: second.size },
            ],
        };

        let all = open_content_checked(backend.clone(), &storage_ref, None)
            .await
            .unwrap();
        let all = collect_stream(all).await.unwrap();
        assert_eq!(all, b"hello world");

        let middle = open_content_checked(
            backend,
            &storage_ref,
            Some(ByteRange { start: 4, end: 7 }),
        )
        .await
        .unwrap();
        assert_eq!(collect_stream(middle).await.unwrap(), b"o wo");
    }
}
