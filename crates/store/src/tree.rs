use std::collections::{HashMap, HashSet};

use tracepulse_core::ids::SpanId;
use tracepulse_core::model::span::Span;
use tracepulse_core::query::{HierarchyEntry, TraceHierarchy};

/// Builds the depth-first rendering order for `spans`, which must already be
/// sorted by (start_time, span_id). Real roots come first; spans whose parent
/// is missing hang under one synthetic root. If parent links loop, the result
/// is a flat listing flagged `cyclic`.
pub fn build_hierarchy(spans: &[&Span]) -> TraceHierarchy {
    let known: HashSet<&SpanId> = spans.iter().map(|s| &s.span_id).collect();
    let mut children: HashMap<&SpanId, Vec<&Span>> = HashMap::new();
    let mut roots = Vec::new();
    let mut orphans = Vec::new();

    for span in spans {
        match &span.parent_span_id {
            None => roots.push(*span),
            Some(parent) if known.contains(parent) => {
                children.entry(parent).or_default().push(*span)
            }
            Some(_) => orphans.push(*span),
        }
    }

    let mut entries = Vec::with_capacity(spans.len() + 1);
    let mut visited: HashSet<&SpanId> = HashSet::new();

    for root in roots.iter().copied() {
        walk(root, 0, None, &children, &mut visited, &mut entries);
    }
    if !orphans.is_empty() {
        let synthetic = SpanId::synthetic_root();
        entries.push(HierarchyEntry {
            span_id: synthetic.clone(),
            parent_span_id: None,
            depth: 0,
            synthetic: true,
        });
        for orphan in orphans.iter().copied() {
            walk(
                orphan,
                1,
                Some(synthetic.clone()),
                &children,
                &mut visited,
                &mut entries,
            );
        }
    }

    if visited.len() < spans.len() {
        return TraceHierarchy {
            entries: spans
                .iter()
                .map(|s| HierarchyEntry {
                    span_id: s.span_id.clone(),
                    parent_span_id: s.parent_span_id.clone(),
                    depth: 0,
                    synthetic: false,
                })
                .collect(),
            orphan_count: orphans.len(),
            cyclic: true,
        };
    }

    TraceHierarchy {
        entries,
        orphan_count: orphans.len(),
        cyclic: false,
    }
}

fn walk<'a>(
    start: &'a Span,
    depth: usize,
    display_parent: Option<SpanId>,
    children: &HashMap<&SpanId, Vec<&'a Span>>,
    visited: &mut HashSet<&'a SpanId>,
    entries: &mut Vec<HierarchyEntry>,
) {
    let mut stack = vec![(start, depth, display_parent)];
    while let Some((span, depth, parent)) = stack.pop() {
        if !visited.insert(&span.span_id) {
            continue;
        }
        entries.push(HierarchyEntry {
            span_id: span.span_id.clone(),
            parent_span_id: parent,
            depth,
            synthetic: false,
        });
        if let Some(kids) = children.get(&span.span_id) {
            // reversed so the earliest child is popped first
            for child in kids.iter().rev() {
                stack.push((*child, depth + 1, Some(span.span_id.clone())));
            }
        }
    }
}
