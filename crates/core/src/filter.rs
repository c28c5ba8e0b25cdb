//! Accept/ignore policy applied to incoming frames by source.

use std::collections::HashSet;
use std::hash::Hash;

/// Which list, if any, decides whether a source is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiveMode {
    /// Every source is accepted.
    #[default]
    AcceptAll,
    /// Everything except sources on the ignore list.
    RejectIgnoreListed,
    /// Only sources on the accept list.
    AcceptListedOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

/// Ignore list, accept list and the active [`ReceiveMode`].
///
/// Both lists are maintained independently of the mode; switching modes
/// only changes which list is consulted.
#[derive(Debug, Clone)]
pub struct ReceiveFilter<K> {
    mode: ReceiveMode,
    ignore: HashSet<K>,
    accept: HashSet<K>,
}

impl<K: Eq + Hash> ReceiveFilter<K> {
    pub fn new(mode: ReceiveMode) -> Self {
        Self {
            mode,
            ignore: HashSet::new(),
            accept: HashSet::new(),
        }
    }

    pub fn mode(&self) -> ReceiveMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ReceiveMode) {
        self.mode = mode;
    }

    pub fn decision(&self, source: &K) -> Verdict {
        let accepted = match self.mode {
            ReceiveMode::AcceptAll => true,
            ReceiveMode::RejectIgnoreListed => !self.ignore.contains(source),
            ReceiveMode::AcceptListedOnly => self.accept.contains(source),
        };
        if accepted { Verdict::Accept } else { Verdict::Reject }
    }

    /// Returns `false` if the source was already listed.
    pub fn add_to_ignore_list(&mut self, source: K) -> bool {
        self.ignore.insert(source)
    }

    /// Returns `false` if the source was not listed.
    pub fn delete_from_ignore_list(&mut self, source: &K) -> bool {
        self.ignore.remove(source)
    }

    pub fn clear_ignore_list(&mut self) {
        self.ignore.clear();
    }

    pub fn add_to_accept_list(&mut self, source: K) -> bool {
        self.accept.insert(source)
    }

    pub fn delete_from_accept_list(&mut self, source: &K) -> bool {
        self.accept.remove(source)
    }

    pub fn clear_accept_list(&mut self) {
        self.accept.clear();
    }
}

impl<K: Eq + Hash> Default for ReceiveFilter<K> {
    fn default() -> Self {
        Self::new(ReceiveMode::AcceptAll)
    }
}
