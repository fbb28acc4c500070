use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod canonical;
pub mod error;

pub use error::{ErrorCode, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Generate,
    Register,
}

impl ServiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::Generate => "generate",
            ServiceType::Register => "register",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "generate" => Some(ServiceType::Generate),
            "register" => Some(ServiceType::Register),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceStatus {
    #[serde(rename = "notline")]
    NotLine,
    Online,
    Offline,
    UpAuditing,
    DownAuditing,
    UpReject,
    DownReject,
    #[serde(other)]
    Unknown,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::NotLine => "notline",
            ServiceStatus::Online => "online",
            ServiceStatus::Offline => "offline",
            ServiceStatus::UpAuditing => "up-auditing",
            ServiceStatus::DownAuditing => "down-auditing",
            ServiceStatus::UpReject => "up-reject",
            ServiceStatus::DownReject => "down-reject",
            ServiceStatus::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "notline" => ServiceStatus::NotLine,
            "online" => ServiceStatus::Online,
            "offline" => ServiceStatus::Offline,
            "up-auditing" => ServiceStatus::UpAuditing,
            "down-auditing" => ServiceStatus::DownAuditing,
            "up-reject" => ServiceStatus::UpReject,
            "down-reject" => ServiceStatus::DownReject,
            _ => ServiceStatus::Unknown,
        }
    }

    /// A service still serves traffic while an offline request is under
    /// review or after that request was rejected.
    pub fn is_dispatchable(self) -> bool {
        matches!(
            self,
            ServiceStatus::Online | ServiceStatus::DownAuditing | ServiceStatus::DownReject
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreateModel {
    Wizard,
    Script,
}

impl CreateModel {
    pub fn as_str(self) -> &'static str {
        match self {
            CreateModel::Wizard => "wizard",
            CreateModel::Script => "script",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "wizard" => Some(CreateModel::Wizard),
            "script" => Some(CreateModel::Script),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Request,
    Response,
}

impl ParamType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "request" => Some(ParamType::Request),
            "response" => Some(ParamType::Response),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Int,
    Long,
    Float,
    Double,
    Boolean,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Int => "int",
            DataType::Long => "long",
            DataType::Float => "float",
            DataType::Double => "double",
            DataType::Boolean => "boolean",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "string" => Some(DataType::String),
            "int" => Some(DataType::Int),
            "long" => Some(DataType::Long),
            "float" => Some(DataType::Float),
            "double" => Some(DataType::Double),
            "boolean" | "bool" => Some(DataType::Boolean),
            _ => None,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, DataType::Int | DataType::Long)
    }

    pub fn is_fractional(self) -> bool {
        matches!(self, DataType::Float | DataType::Double)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "like")]
    Like,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Like => "like",
            Operator::In => "in",
            Operator::NotIn => "not in",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_lowercase();
        match normalized.as_str() {
            "=" => Some(Operator::Eq),
            "!=" | "<>" => Some(Operator::Ne),
            ">" => Some(Operator::Gt),
            ">=" => Some(Operator::Ge),
            "<" => Some(Operator::Lt),
            "<=" => Some(Operator::Le),
            "like" => Some(Operator::Like),
            "in" => Some(Operator::In),
            "not in" => Some(Operator::NotIn),
            _ => None,
        }
    }

    pub fn is_list(self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
    #[default]
    Unsorted,
}

impl SortOrder {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "asc" => SortOrder::Asc,
            "desc" => SortOrder::Desc,
            _ => SortOrder::Unsorted,
        }
    }

    pub fn sql_keyword(self) -> Option<&'static str> {
        match self {
            SortOrder::Asc => Some("ASC"),
            SortOrder::Desc => Some("DESC"),
            SortOrder::Unsorted => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Header,
    Query,
    Path,
    Body,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub service_id: String,
    pub service_name: String,
    pub service_path: String,
    pub http_method: String,
    pub service_type: ServiceType,
    pub status: ServiceStatus,
    #[serde(default)]
    pub publish_status: String,
    pub create_model: CreateModel,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub rate_limit_per_second: u32,
    #[serde(default)]
    pub backend_host: String,
    #[serde(default)]
    pub backend_path: String,
    #[serde(default)]
    pub department_id: String,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub deleted_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceParam {
    pub param_type: ParamType,
    pub en_name: String,
    #[serde(default)]
    pub cn_name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub operator: Option<Operator>,
    #[serde(default)]
    pub sort: SortOrder,
    #[serde(default)]
    pub masking: Option<String>,
    #[serde(default)]
    pub sequence: i32,
    #[serde(default)]
    pub data_protection_query: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDataSource {
    pub data_view_id: String,
    pub catalog_name: String,
    pub data_schema_name: String,
    pub data_table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceScriptModel {
    pub script: String,
    #[serde(default)]
    pub page_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceResponseFilter {
    pub param: String,
    pub operator: Operator,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubService {
    pub sub_service_id: String,
    pub service_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub row_filter_clause: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAssociations {
    pub service: Service,
    pub data_source: Option<ServiceDataSource>,
    pub script_model: Option<ServiceScriptModel>,
    pub params: Vec<ServiceParam>,
    pub response_filters: Vec<ServiceResponseFilter>,
    pub sub_services: Vec<SubService>,
}

impl ServiceAssociations {
    pub fn page_size(&self) -> Option<u32> {
        self.script_model
            .as_ref()
            .map(|m| m.page_size)
            .filter(|size| *size > 0)
    }
}

/// A caller-supplied value and where it came from. Body values keep their
/// JSON shape (numbers as the original token); header and query values are
/// always strings until coerced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub value: serde_json::Value,
    pub position: Position,
    pub data_type: Option<DataType>,
}

impl Param {
    pub fn new(value: serde_json::Value, position: Position) -> Self {
        Self {
            value,
            position,
            data_type: None,
        }
    }

    pub fn text(&self) -> String {
        canonical::scalar_to_string(&self.value)
    }

    pub fn is_empty(&self) -> bool {
        match &self.value {
            serde_json::Value::Null => true,
            serde_json::Value::String(s) => s.trim().is_empty(),
            serde_json::Value::Array(values) => values.is_empty(),
            _ => false,
        }
    }
}

pub type ParamMap = BTreeMap<String, Param>;

pub const PAGE_PARAM: &str = "offset";
pub const PAGE_SIZE_PARAM: &str = "limit";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub service_id: String,
    pub service_name: String,
    pub service_path: String,
    pub service_department_id: String,
    pub remote_address: String,
    pub forward_for: String,
    pub user_identification: String,
    pub app_id: String,
    pub call_start_time_ms: i64,
    pub call_end_time_ms: i64,
    pub status_code: u16,
    pub call_status: i16,
    pub error_message: String,
}

impl CallRecord {
    pub fn succeeded(&self) -> bool {
        self.call_status == 1
    }
}
