use garde::Validate;

use crate::{
    Error, Result,
    api::{
        AIGatewayRoute, AIServiceBackend, BackendSecurityPolicy, BackendSecurityPolicyType,
    },
};

/// Reconcilers call these before materializing anything, so objects that
/// slipped past admission (or predate it) never produce partial emissions.

pub fn validate_ai_gateway_route(route: &AIGatewayRoute) -> Result<()> {
    route.spec.validate().map_err(|report| Error::Validation {
        kind: "AIGatewayRoute",
        report: report.to_string(),
    })
}

pub fn validate_ai_service_backend(backend: &AIServiceBackend) -> Result<()> {
    backend.spec.validate().map_err(|report| Error::Validation {
        kind: "AIServiceBackend",
        report: report.to_string(),
    })
}

pub fn validate_backend_security_policy(policy: &BackendSecurityPolicy) -> Result<()> {
    policy.spec.validate().map_err(|report| Error::Validation {
        kind: "BackendSecurityPolicy",
        report: report.to_string(),
    })?;

    let spec = &policy.spec;
    let branch_error = |report: String| Error::Validation {
        kind: "BackendSecurityPolicy",
        report,
    };
    match spec.policy_type {
        BackendSecurityPolicyType::APIKey => {
            if spec.api_key.is_none() {
                return Err(branch_error("type is APIKey but apiKey is unset".into()));
            }
            if spec.aws_credentials.is_some() {
                return Err(branch_error(
                    "type is APIKey but awsCredentials is populated".into(),
                ));
            }
        }
        BackendSecurityPolicyType::AWSCredentials => {
            if spec.api_key.is_some() {
                return Err(branch_error(
                    "type is AWSCredentials but apiKey is populated".into(),
                ));
            }
            let Some(aws) = &spec.aws_credentials else {
                return Err(branch_error(
                    "type is AWSCredentials but awsCredentials is unset".into(),
                ));
            };
            match (&aws.credentials_file, &aws.oidc_exchange_token) {
                (Some(_), Some(_)) => {
                    return Err(branch_error(
                        "awsCredentials must set exactly one of credentialsFile and oidcExchangeToken, got both"
                            .into(),
                    ));
                }
                (None, None) => {
                    return Err(branch_error(
                        "awsCredentials must set exactly one of credentialsFile and oidcExchangeToken, got neither"
                            .into(),
                    ));
                }
                _ => {}
            }
        }
    }
    Ok(())
}
