use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Unavailable,
    Unauthorized,
    SqlUnsafe,
    Upstream,
    Transient,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidParameter,
    ServicePathNotExist,
    ServiceMethodNotAllowed,
    DataViewIdNotExist,
    ServiceStatusNotAvailable,
    Unauthenticated,
    ServiceApplyNotPass,
    ServiceApplyNotPassCssjj,
    RateLimitError,
    ServiceSqlSyntaxError,
    QueryError,
    BackendUnsupportedContentType,
    BackendServiceError,
    StoreUnavailable,
    UpstreamUnavailable,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidParameter => "DataApplicationGateway.Public.InvalidParameter",
            ErrorCode::ServicePathNotExist => "DataApplicationGateway.Service.ServicePathNotExist",
            ErrorCode::ServiceMethodNotAllowed => {
                "DataApplicationGateway.Service.ServiceMethodNotAllowed"
            }
            ErrorCode::DataViewIdNotExist => "DataApplicationGateway.Service.DataViewIdNotExist",
            ErrorCode::ServiceStatusNotAvailable => {
                "DataApplicationGateway.Service.ServiceStatusNotAvailable"
            }
            ErrorCode::Unauthenticated => "DataApplicationGateway.Public.Unauthenticated",
            ErrorCode::ServiceApplyNotPass => "DataApplicationGateway.Service.ServiceApplyNotPass",
            ErrorCode::ServiceApplyNotPassCssjj => {
                "DataApplicationGateway.Service.ServiceApplyNotPassCssjj"
            }
            ErrorCode::RateLimitError => "DataApplicationGateway.Service.RateLimitError",
            ErrorCode::ServiceSqlSyntaxError => {
                "DataApplicationGateway.Service.ServiceSQLSyntaxError"
            }
            ErrorCode::QueryError => "DataApplicationGateway.Query.QueryError",
            ErrorCode::BackendUnsupportedContentType => {
                "DataApplicationGateway.Backend.BackendUnsupportedContentType"
            }
            ErrorCode::BackendServiceError => "DataApplicationGateway.Backend.BackendServiceError",
            ErrorCode::StoreUnavailable => "DataApplicationGateway.Public.StoreUnavailable",
            ErrorCode::UpstreamUnavailable => "DataApplicationGateway.Public.UpstreamUnavailable",
            ErrorCode::InternalError => "DataApplicationGateway.Public.InternalError",
        }
    }

    pub fn kind(self) -> ErrorKind {
        match self {
            ErrorCode::InvalidParameter | ErrorCode::ServiceMethodNotAllowed => {
                ErrorKind::Validation
            }
            ErrorCode::ServicePathNotExist | ErrorCode::DataViewIdNotExist => ErrorKind::NotFound,
            ErrorCode::ServiceStatusNotAvailable => ErrorKind::Unavailable,
            ErrorCode::Unauthenticated
            | ErrorCode::ServiceApplyNotPass
            | ErrorCode::ServiceApplyNotPassCssjj
            | ErrorCode::RateLimitError => ErrorKind::Unauthorized,
            ErrorCode::ServiceSqlSyntaxError => ErrorKind::SqlUnsafe,
            ErrorCode::QueryError
            | ErrorCode::BackendUnsupportedContentType
            | ErrorCode::BackendServiceError => ErrorKind::Upstream,
            ErrorCode::StoreUnavailable | ErrorCode::UpstreamUnavailable => ErrorKind::Transient,
            ErrorCode::InternalError => ErrorKind::Internal,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::InvalidParameter => "request parameters are invalid",
            ErrorCode::ServicePathNotExist => "service path does not exist",
            ErrorCode::ServiceMethodNotAllowed => "request method does not match the service",
            ErrorCode::DataViewIdNotExist => "data view of the service does not exist",
            ErrorCode::ServiceStatusNotAvailable => "service is not available in its current status",
            ErrorCode::Unauthenticated => "caller identity could not be resolved",
            ErrorCode::ServiceApplyNotPass => "caller is not authorized to use this service",
            ErrorCode::ServiceApplyNotPassCssjj => "request signature validation failed",
            ErrorCode::RateLimitError => "rate limit exceeded for this service",
            ErrorCode::ServiceSqlSyntaxError => "service SQL is not an allowed query",
            ErrorCode::QueryError => "virtual engine query failed",
            ErrorCode::BackendUnsupportedContentType => {
                "backend service returned an unsupported content type"
            }
            ErrorCode::BackendServiceError => "backend service request failed",
            ErrorCode::StoreUnavailable => "service store is unavailable",
            ErrorCode::UpstreamUnavailable => "a dependent service is unavailable",
            ErrorCode::InternalError => "internal error",
        }
    }

    pub fn solution(self) -> &'static str {
        match self {
            ErrorCode::InvalidParameter => "check the request parameters against the service definition",
            ErrorCode::ServicePathNotExist => "check the service path",
            ErrorCode::ServiceMethodNotAllowed => "use the HTTP method the service was published with",
            ErrorCode::DataViewIdNotExist => "check the data view bound to the service",
            ErrorCode::ServiceStatusNotAvailable => "contact the service owner to bring it online",
            ErrorCode::Unauthenticated => "provide valid caller credentials",
            ErrorCode::ServiceApplyNotPass => "apply for access to this service",
            ErrorCode::ServiceApplyNotPassCssjj => {
                "check the x-tif-timestamp, x-tif-nonce and x-tif-signature headers"
            }
            ErrorCode::RateLimitError => "retry later",
            ErrorCode::ServiceSqlSyntaxError => "only single SELECT statements with explicit columns are allowed",
            ErrorCode::QueryError => "check the query and the data source",
            ErrorCode::BackendUnsupportedContentType => "backend services must return application/json",
            ErrorCode::BackendServiceError => "check the backend service",
            ErrorCode::StoreUnavailable | ErrorCode::UpstreamUnavailable => "retry later",
            ErrorCode::InternalError => "contact the administrator",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_kinds() {
        assert_eq!(ErrorCode::InvalidParameter.kind(), ErrorKind::Validation);
        assert_eq!(ErrorCode::ServicePathNotExist.kind(), ErrorKind::NotFound);
        assert_eq!(
            ErrorCode::ServiceStatusNotAvailable.kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(ErrorCode::RateLimitError.kind(), ErrorKind::Unauthorized);
        assert_eq!(ErrorCode::ServiceSqlSyntaxError.kind(), ErrorKind::SqlUnsafe);
        assert_eq!(
            ErrorCode::BackendUnsupportedContentType.kind(),
            ErrorKind::Upstream
        );
    }

    #[test]
    fn code_strings_keep_wire_spelling() {
        assert!(
            ErrorCode::ServiceSqlSyntaxError
                .as_str()
                .ends_with("ServiceSQLSyntaxError")
        );
        assert!(
            ErrorCode::ServiceApplyNotPassCssjj
                .as_str()
                .ends_with("ServiceApplyNotPassCssjj")
        );
    }
}
