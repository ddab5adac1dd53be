//! Trigger trie.
//!
//! Handlers are mounted on a per-method prefix trie over `/`-delimited
//! path segments. Lookup is case-sensitive and greedy: the deepest node
//! holding a trigger wins, and the matched prefix length is recorded in
//! the query info.

use std::collections::HashMap;
use std::rc::Rc;

use rill_core::El;

use crate::codec::QInfo;

use super::Query;

/// A handler mounted at a path in the server trie.
pub trait Trigger {
    /// A request head matched this trigger. The body has not been read
    /// yet; install `on_data`/`on_done` hooks (or
    /// [`Query::bufferize`]) here.
    fn on_query(&self, el: &mut El, q: &Rc<Query>, info: &Rc<QInfo>);

    /// When set, HTTP basic authentication is extracted before dispatch
    /// and [`Trigger::on_auth`] decides; a malformed `Authorization`
    /// header is rejected with 400 up front.
    fn auth_realm(&self) -> Option<&str> {
        None
    }

    /// Inspect the decoded credentials (empty when the request carried
    /// none); reject with [`Query::reject_unauthorized`] to refuse.
    fn on_auth(&self, el: &mut El, q: &Rc<Query>, user: &str, password: &str) {
        let _ = (el, q, user, password);
    }

    /// The query record is going away; release anything stashed on it.
    fn on_query_wipe(&self, q: &Query) {
        let _ = q;
    }
}

#[derive(Default)]
pub(crate) struct TriggerNode {
    children: HashMap<String, TriggerNode>,
    trigger: Option<Rc<dyn Trigger>>,
}

impl TriggerNode {
    pub(crate) fn is_empty(&self) -> bool {
        self.trigger.is_none() && self.children.is_empty()
    }

    /// Install `trigger` at `path`, creating intermediate nodes; returns
    /// the previously installed trigger, if any.
    pub(crate) fn register(
        &mut self,
        path: &str,
        trigger: Rc<dyn Trigger>,
    ) -> Option<Rc<dyn Trigger>> {
        let mut node = self;
        for seg in path.split('/').filter(|seg| !seg.is_empty()) {
            node = node.children.entry(seg.to_owned()).or_default();
        }
        node.trigger.replace(trigger)
    }

    /// Remove the trigger at `path` and prune now-empty subtrees.
    pub(crate) fn unregister(&mut self, path: &str) -> Option<Rc<dyn Trigger>> {
        let segs: Vec<&str> = path.split('/').filter(|seg| !seg.is_empty()).collect();
        Self::unregister_rec(self, &segs)
    }

    fn unregister_rec(node: &mut Self, segs: &[&str]) -> Option<Rc<dyn Trigger>> {
        match segs.split_first() {
            None => node.trigger.take(),
            Some((seg, rest)) => {
                let child = node.children.get_mut(*seg)?;
                let removed = Self::unregister_rec(child, rest);
                if child.is_empty() {
                    node.children.remove(*seg);
                }
                removed
            }
        }
    }

    /// Greedy longest-prefix lookup over a canonical absolute path.
    /// Returns the deepest installed trigger and the length of the
    /// matched prefix.
    pub(crate) fn resolve(&self, path: &str) -> (Option<Rc<dyn Trigger>>, usize) {
        let bytes = path.as_bytes();
        let mut node = self;
        let mut found = node.trigger.clone();
        let mut prefix_len = 0;
        let mut i = 0;

        while i < bytes.len() && bytes[i] == b'/' {
            let seg_start = i + 1;
            if seg_start >= bytes.len() {
                break;
            }
            let seg_end = memchr::memchr(b'/', &bytes[seg_start..])
                .map_or(bytes.len(), |off| seg_start + off);
            let Some(child) = node.children.get(&path[seg_start..seg_end]) else {
                break;
            };
            node = child;
            if node.trigger.is_some() {
                found = node.trigger.clone();
                prefix_len = seg_end;
            }
            i = seg_end;
        }
        (found, prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;
    impl Trigger for Nop {
        fn on_query(&self, _el: &mut El, _q: &Rc<Query>, _info: &Rc<QInfo>) {}
    }

    fn node_with(paths: &[&str]) -> TriggerNode {
        let mut root = TriggerNode::default();
        for p in paths {
            assert!(root.register(p, Rc::new(Nop)).is_none());
        }
        root
    }

    #[test]
    fn deepest_prefix_wins() {
        let root = node_with(&["/api", "/api/v2/users"]);

        let (t, len) = root.resolve("/api/v2/users/42");
        assert!(t.is_some());
        assert_eq!(len, "/api/v2/users".len());

        let (t, len) = root.resolve("/api/v1/ping");
        assert!(t.is_some());
        assert_eq!(len, "/api".len());

        let (t, _) = root.resolve("/other");
        assert!(t.is_none());
    }

    #[test]
    fn lookup_is_case_sensitive() {
        let root = node_with(&["/Api"]);
        assert!(root.resolve("/api").0.is_none());
        assert!(root.resolve("/Api").0.is_some());
    }

    #[test]
    fn root_trigger_matches_everything() {
        let root = node_with(&[""]);
        let (t, len) = root.resolve("/anything/at/all");
        assert!(t.is_some());
        assert_eq!(len, 0);
    }

    #[test]
    fn register_returns_replaced_trigger() {
        let mut root = node_with(&["/x"]);
        assert!(root.register("/x", Rc::new(Nop)).is_some());
    }

    #[test]
    fn unregister_prunes_empty_subtrees() {
        let mut root = node_with(&["/a/b/c"]);
        assert!(root.unregister("/a/b/c").is_some());
        assert!(root.is_empty());
        assert!(root.unregister("/a/b/c").is_none());
    }

    #[test]
    fn unregister_keeps_shared_prefixes() {
        let mut root = node_with(&["/a/b", "/a/c"]);
        assert!(root.unregister("/a/b").is_some());
        assert!(root.resolve("/a/c").0.is_some());
        assert!(root.resolve("/a/b").0.is_none());
    }
}
