use vm_orchestrator::ProvisioningService;

#[derive(Clone)]
pub struct AppState {
    pub service: ProvisioningService,
}

impl AppState {
    pub fn new(service: ProvisioningService) -> Self {
        Self { service }
    }
}
