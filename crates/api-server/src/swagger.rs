//! OpenAPI specification and Swagger UI configuration.

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Campaign Sequencer API",
        version = "0.1.0",
        description = "Post-service campaign enrollment and touch scheduling.\n\nPeriodic triggers claim and deliver due touches, sweep queued conflicts and expose lifecycle and alert commands.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Records", description = "Businesses, campaigns, customers and jobs"),
        (name = "Triggers", description = "Periodic batch and sweep triggers"),
        (name = "Conflicts", description = "Job completion and conflict resolution"),
        (name = "Campaigns", description = "Campaign lifecycle, enrollment stop and opt-out"),
        (name = "Alerts", description = "Failed-send alerts"),
        (name = "Operations", description = "Health and liveness checks"),
    ),
    paths(
        // Records
        crate::rest::put_business,
        crate::rest::put_campaign,
        crate::rest::put_customer,
        crate::rest::put_job,
        // Triggers
        crate::rest::process_touches,
        crate::rest::resolve_conflicts,
        // Conflicts
        crate::rest::resolve_conflict,
        crate::rest::revert_conflict,
        crate::rest::complete_job,
        // Campaigns
        crate::rest::pause_campaign,
        crate::rest::resume_campaign,
        crate::rest::delete_campaign,
        crate::rest::stop_enrollment,
        crate::rest::opt_out,
        // Alerts
        crate::rest::retry_alert,
        crate::rest::acknowledge_alert,
        // Operations
        crate::rest::health_check,
        crate::rest::liveness,
    ),
    components(schemas(
        // Domain types
        campaign_core::types::Business,
        campaign_core::types::Campaign,
        campaign_core::types::CampaignStatus,
        campaign_core::types::TouchDefinition,
        campaign_core::types::Customer,
        campaign_core::types::SmsConsent,
        campaign_core::types::Job,
        campaign_core::types::Channel,
        campaign_core::types::StopReason,
        campaign_core::types::EnrollmentResolution,
        campaign_enrollment::ResolveAction,
        campaign_enrollment::JobOutcome,
        campaign_enrollment::SweepReport,
        campaign_enrollment::TouchResults,
        campaign_enrollment::RetryReport,
        campaign_enrollment::LifecycleReport,
        // Request/response types
        crate::rest::ErrorResponse,
        crate::rest::HealthResponse,
        crate::rest::CommandResponse,
        crate::rest::ProcessTouchesResponse,
        crate::rest::TriggerFailure,
        crate::rest::ConflictSweepResponse,
        crate::rest::BusinessRequest,
        crate::rest::CampaignRequest,
        crate::rest::CustomerRequest,
        crate::rest::JobRequest,
        crate::rest::ResolveRequest,
        crate::rest::RevertRequest,
        crate::rest::StopRequest,
        crate::rest::OptOutRequest,
        crate::rest::OptOutResponse,
    )),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "cron_secret",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_trigger_routes() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/v1/cron/process-touches"));
        assert!(doc.paths.paths.contains_key("/v1/cron/resolve-conflicts"));
        assert!(doc.paths.paths.contains_key("/v1/campaigns/{id}/pause"));
        assert!(doc.paths.paths.contains_key("/v1/jobs/{id}"));
        assert!(doc.paths.paths.contains_key("/v1/businesses/{id}"));
    }
}
