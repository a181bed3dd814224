//! Deployment registration point
//!
//! The set of actions and workflows a daemon serves is fixed at process
//! start. Deployments embed their registrations here (or depend on
//! `quern-daemons` directly and host the runner themselves); workers and
//! the submitting side must agree on the registered names.

use std::sync::Arc;

use quern_daemons::{Registry, RegistryBuilder};

/// Build the frozen registry for this deployment.
pub fn build() -> Arc<Registry> {
    let builder = RegistryBuilder::new();

    // Register deployment actions and workflows here before the runner
    // starts, e.g.:
    //
    //     builder.register_action("send_email", send_email);
    //     builder.register_workflow(OnboardingWorkflow);

    builder.build()
}
