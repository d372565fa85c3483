// dispatch.rs - Dispatch trampoline and ARC entry point classification
//
// Finds the addresses through which code reaches objc_msgSend and the ARC
// runtime functions. Stubs for imports may only get their symbols after the
// first analysis pass; until every required stub has been seen the resolver
// is pending, and functions that call into stub sections are queued so they
// can be analyzed again once it is ready.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::sync::mpsc::{self, Receiver, Sender};

use parking_lot::ReentrantMutex;
use tracing::{debug, info};

use crate::abi;
use crate::image::{BinaryImage, SectionRange, Symbol, SymbolKind};

/// Readiness of the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Waiting for symbols of these imported stubs
    Pending { awaiting: BTreeSet<String> },
    Ready,
}

struct Inner {
    readiness: Readiness,
    msg_send: BTreeSet<u64>,
    arc: BTreeSet<u64>,
    queued: BTreeSet<u64>,
    released: Vec<u64>,
    events: Receiver<Symbol>,
}

impl Inner {
    fn apply(&mut self, symbol: Symbol) {
        let Readiness::Pending { awaiting } = &mut self.readiness else {
            return;
        };
        if symbol.kind != SymbolKind::ImportedFunction || !awaiting.remove(&symbol.name) {
            return;
        }

        if symbol.name == abi::MSG_SEND {
            self.msg_send.insert(symbol.address);
        } else {
            self.arc.insert(symbol.address);
        }
        debug!("Located stub {} at {:#x}", symbol.name, symbol.address);

        if awaiting.is_empty() {
            self.readiness = Readiness::Ready;
            self.released.extend(std::mem::take(&mut self.queued));
            info!(
                "Dispatch stubs located; {} functions need another pass",
                self.released.len()
            );
        }
    }
}

/// Classifies call targets for one binary.
pub struct DispatchResolver {
    stub_sections: Vec<SectionRange>,
    sender: Sender<Symbol>,
    inner: ReentrantMutex<RefCell<Inner>>,
}

impl DispatchResolver {
    /// Scan `image` for the dispatch and ARC entry points.
    pub fn new(image: &dyn BinaryImage) -> Self {
        let stub_sections: Vec<SectionRange> = abi::STUB_SECTIONS
            .iter()
            .filter_map(|name| image.section(name))
            .collect();
        let slot_sections: Vec<SectionRange> = abi::IMPORT_SLOT_SECTIONS
            .iter()
            .filter_map(|name| image.section(name))
            .collect();

        let mut msg_send = BTreeSet::new();
        let mut arc = BTreeSet::new();
        let mut required = BTreeSet::new();
        let mut located = BTreeSet::new();

        let names = std::iter::once(abi::MSG_SEND).chain(abi::ARC_FUNCTIONS.iter().copied());
        for name in names {
            let targets = if name == abi::MSG_SEND {
                &mut msg_send
            } else {
                &mut arc
            };
            for symbol in image.symbols_named(name) {
                if slot_sections.iter().any(|s| s.contains(symbol.address)) {
                    targets.insert(symbol.address);
                    required.insert(name.to_string());
                }
                if stub_sections.iter().any(|s| s.contains(symbol.address)) {
                    targets.insert(symbol.address);
                    located.insert(name.to_string());
                }
            }
        }

        let awaiting: BTreeSet<String> = required.difference(&located).cloned().collect();
        let readiness = if stub_sections.is_empty() || awaiting.is_empty() {
            Readiness::Ready
        } else {
            debug!("Waiting for stubs: {:?}", awaiting);
            Readiness::Pending { awaiting }
        };

        let (sender, events) = mpsc::channel();
        Self {
            stub_sections,
            sender,
            inner: ReentrantMutex::new(RefCell::new(Inner {
                readiness,
                msg_send,
                arc,
                queued: BTreeSet::new(),
                released: Vec::new(),
                events,
            })),
        }
    }

    /// Channel on which the host reports newly defined symbols.
    pub fn symbol_sender(&self) -> Sender<Symbol> {
        self.sender.clone()
    }

    /// Report a newly defined symbol.
    pub fn symbol_added(&self, symbol: Symbol) {
        // The receiver lives as long as self, so this cannot fail
        let _ = self.sender.send(symbol);
        self.with_inner(|_| ());
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let inner = &mut *inner;
        while let Ok(symbol) = inner.events.try_recv() {
            inner.apply(symbol);
        }
        f(inner)
    }

    pub fn readiness(&self) -> Readiness {
        self.with_inner(|inner| inner.readiness.clone())
    }

    pub fn is_ready(&self) -> bool {
        self.with_inner(|inner| inner.readiness == Readiness::Ready)
    }

    pub fn is_message_send(&self, address: u64) -> bool {
        self.with_inner(|inner| inner.msg_send.contains(&address))
    }

    pub fn is_arc_function(&self, address: u64) -> bool {
        self.with_inner(|inner| inner.arc.contains(&address))
    }

    pub fn message_send_functions(&self) -> Vec<u64> {
        self.with_inner(|inner| inner.msg_send.iter().copied().collect())
    }

    pub fn arc_functions(&self) -> Vec<u64> {
        self.with_inner(|inner| inner.arc.iter().copied().collect())
    }

    pub fn has_message_send_functions(&self) -> bool {
        self.with_inner(|inner| !inner.msg_send.is_empty())
    }

    pub fn is_in_stub_section(&self, address: u64) -> bool {
        self.stub_sections.iter().any(|s| s.contains(address))
    }

    /// Queue a function for another pass if the resolver is still pending.
    /// Returns whether it was queued.
    pub fn defer_function(&self, address: u64) -> bool {
        self.with_inner(|inner| match inner.readiness {
            Readiness::Pending { .. } => {
                inner.queued.insert(address);
                true
            }
            Readiness::Ready => false,
        })
    }

    /// Functions that need another pass now that the resolver is ready.
    /// Each queued function is handed out once.
    pub fn take_reanalysis(&self) -> Vec<u64> {
        self.with_inner(|inner| std::mem::take(&mut inner.released))
    }
}
