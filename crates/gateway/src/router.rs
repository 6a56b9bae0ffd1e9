//! Kind → gateway routing.

use std::collections::HashMap;
use std::sync::Arc;

use lumagen_core::{GenerationError, GenerationResult, JobKind};

use crate::provider::ProviderGateway;

/// Routes each job kind to its (usually protected) gateway instance.
///
/// Downstream code depends only on `ProviderGateway`; vendor choice is a
/// wiring decision made once, here.
#[derive(Clone, Default)]
pub struct ProviderRouter {
    gateways: HashMap<JobKind, Arc<dyn ProviderGateway>>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gateway(mut self, kind: JobKind, gateway: Arc<dyn ProviderGateway>) -> Self {
        self.gateways.insert(kind, gateway);
        self
    }

    pub fn for_kind(&self, kind: JobKind) -> GenerationResult<Arc<dyn ProviderGateway>> {
        self.gateways.get(&kind).cloned().ok_or_else(|| {
            GenerationError::validation(format!("no provider configured for {kind} generation"))
        })
    }

    pub fn kinds(&self) -> impl Iterator<Item = JobKind> + '_ {
        self.gateways.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;

    #[test]
    fn unrouted_kind_is_a_validation_error() {
        let router =
            ProviderRouter::new().with_gateway(JobKind::Photo, Arc::new(MockProvider::new("mock")));

        assert!(router.for_kind(JobKind::Photo).is_ok());
        assert!(matches!(
            router.for_kind(JobKind::Video).err().unwrap(),
            GenerationError::Validation(_)
        ));
    }
}
