// session.rs - Per-binary state shared by function rewrites
//
// A host opens one session per binary and then asks for functions to be
// processed, possibly from many threads at once. Structure analysis for a
// session runs exactly once; every later request gets the same frozen
// `AnalysisInfo`, and the first sink offered for the session receives its
// annotations. Sessions for unsupported targets are marked ignored and
// short-circuit from then on. Panics from analysis, annotation or a rewrite
// are caught and logged here.

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::analyzers;
use crate::annotate::{self, AnnotationSink};
use crate::config::Settings;
use crate::dispatch::DispatchResolver;
use crate::error::Error;
use crate::il::Function;
use crate::image::{BinaryImage, ImageMemory, Symbol};
use crate::model::AnalysisInfo;
use crate::rewrite::{self, RewriteContext, RewriteReport};

/// Identifies one binary for the lifetime of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

struct SessionInfo {
    info: Arc<AnalysisInfo>,
    annotated: bool,
}

/// Session-keyed analysis results and dispatch resolvers.
#[derive(Default)]
pub struct Registry {
    infos: Mutex<HashMap<SessionId, SessionInfo>>,
    resolvers: Mutex<HashMap<SessionId, Arc<DispatchResolver>>>,
    ignored: Mutex<HashSet<SessionId>>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_analysis(id: SessionId, image: &dyn BinaryImage) -> AnalysisInfo {
    match panic::catch_unwind(AssertUnwindSafe(|| analyzers::analyze(image))) {
        Ok(info) => info,
        Err(payload) => {
            error!(
                "Session {}: {}",
                id.0,
                Error::Analysis(panic_message(payload.as_ref()))
            );
            AnalysisInfo::new()
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Structure analysis of `image`, run on first request.
    ///
    /// The registry lock is held for the whole walk, so concurrent callers
    /// wait for the first one and share its result. A walk that panics is
    /// logged and recorded as an empty analysis.
    pub fn analysis_info(&self, id: SessionId, image: &dyn BinaryImage) -> Arc<AnalysisInfo> {
        self.load_info(id, image, None)
    }

    /// Like [`Registry::analysis_info`], and also sends the recovered
    /// metadata to `sink` the first time a sink is offered for the session.
    /// Later calls leave `sink` untouched.
    pub fn annotated_analysis_info(
        &self,
        id: SessionId,
        image: &dyn BinaryImage,
        sink: &mut dyn AnnotationSink,
    ) -> Arc<AnalysisInfo> {
        self.load_info(id, image, Some(sink))
    }

    fn load_info(
        &self,
        id: SessionId,
        image: &dyn BinaryImage,
        sink: Option<&mut dyn AnnotationSink>,
    ) -> Arc<AnalysisInfo> {
        let mut infos = self.infos.lock();
        let entry = infos.entry(id).or_insert_with(|| SessionInfo {
            info: Arc::new(run_analysis(id, image)),
            annotated: false,
        });

        if let Some(sink) = sink {
            if !entry.annotated {
                entry.annotated = true;
                let message_sends = self.resolver(id, image).message_send_functions();
                let info = &entry.info;
                let applied = panic::catch_unwind(AssertUnwindSafe(|| {
                    annotate::apply_info(image, info, &message_sends, sink)
                }));
                if let Err(payload) = applied {
                    error!(
                        "Session {}: annotation failed: {}",
                        id.0,
                        Error::Analysis(panic_message(payload.as_ref()))
                    );
                }
            }
        }

        Arc::clone(&entry.info)
    }

    /// Dispatch resolver for `image`, created on first request.
    pub fn resolver(&self, id: SessionId, image: &dyn BinaryImage) -> Arc<DispatchResolver> {
        let mut resolvers = self.resolvers.lock();
        Arc::clone(
            resolvers
                .entry(id)
                .or_insert_with(|| Arc::new(DispatchResolver::new(image))),
        )
    }

    pub fn is_ignored(&self, id: SessionId) -> bool {
        self.ignored.lock().contains(&id)
    }

    fn ignore(&self, id: SessionId) {
        self.ignored.lock().insert(id);
    }

    /// Forward a newly defined symbol to the session's resolver.
    pub fn symbol_added(&self, id: SessionId, symbol: Symbol) {
        let resolver = self.resolvers.lock().get(&id).cloned();
        if let Some(resolver) = resolver {
            resolver.symbol_added(symbol);
        }
    }

    /// Functions deferred while stubs were unresolved that are now due for
    /// another pass.
    pub fn functions_to_reanalyze(&self, id: SessionId) -> Vec<u64> {
        let resolver = self.resolvers.lock().get(&id).cloned();
        resolver.map(|r| r.take_reanalysis()).unwrap_or_default()
    }

    /// Rewrite the call sites of `function`.
    ///
    /// Returns `None` when the session is ignored or the function could not
    /// be rewritten; the function is then left as it was.
    pub fn process_function(
        &self,
        id: SessionId,
        image: &dyn BinaryImage,
        function: &mut Function,
        settings: &Settings,
    ) -> Option<RewriteReport> {
        if self.is_ignored(id) {
            return None;
        }

        let architecture = image.architecture();
        if !architecture.supports_rewriting() {
            error!(
                "Session {}: architecture {} is not supported; ignoring binary",
                id.0, architecture
            );
            self.ignore(id);
            return None;
        }

        let resolver = self.resolver(id, image);
        if !resolver.has_message_send_functions() {
            error!(
                "Session {}: no objc_msgSend entry points found; ignoring binary",
                id.0
            );
            self.ignore(id);
            return None;
        }

        let info = self.analysis_info(id, image);
        let memory = ImageMemory::new(image);
        let cx = RewriteContext {
            info: &info,
            resolver: &resolver,
            settings,
            memory: &memory,
        };

        let address = function.address;
        match panic::catch_unwind(AssertUnwindSafe(|| rewrite::rewrite_function(function, &cx))) {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                debug!("Skipping function {:#x}: {}", address, e);
                None
            }
            Err(payload) => {
                error!(
                    "Session {}: function {:#x}: {}",
                    id.0,
                    address,
                    Error::Analysis(panic_message(payload.as_ref()))
                );
                None
            }
        }
    }

    /// Drop everything held for a session.
    pub fn end_session(&self, id: SessionId) {
        self.infos.lock().remove(&id);
        self.resolvers.lock().remove(&id);
        self.ignored.lock().remove(&id);
    }
}
