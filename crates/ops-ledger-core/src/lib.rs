use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

/// Format version written into every envelope produced by the backup
/// serializer. Snapshots produced before the envelope wrapper existed carry no
/// version at all and are accepted as the legacy bare-payload shape.
pub const SNAPSHOT_FORMAT_VERSION: &str = "2";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SnapshotError {
    #[error("snapshot is not parseable: {0}")]
    MalformedInput(String),
    #[error("snapshot matches neither the current envelope shape nor the legacy payload shape")]
    MissingPayload,
    #[error("schema violation in {category}: {detail}")]
    SchemaViolation { category: Category, detail: String },
    #[error("dangling reference in {category}: {reference} does not resolve to an existing row")]
    DanglingReference { category: Category, reference: String },
    #[error("restore transaction failed while {phase}: {cause}")]
    TransactionFailure { phase: RestorePhase, cause: String },
    #[error("backup read failed: {cause}")]
    BackupFailed { cause: String },
}

impl SnapshotError {
    /// Stable machine-readable discriminant for CLI and service error output.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedInput(_) => "malformed_input",
            Self::MissingPayload => "missing_payload",
            Self::SchemaViolation { .. } => "schema_violation",
            Self::DanglingReference { .. } => "dangling_reference",
            Self::TransactionFailure { .. } => "transaction_failure",
            Self::BackupFailed { .. } => "backup_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RestorePhase {
    Preflight,
    Clearing,
    Creating,
    Committing,
}

impl RestorePhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preflight => "preflight",
            Self::Clearing => "clearing",
            Self::Creating => "creating",
            Self::Committing => "committing",
        }
    }
}

impl Display for RestorePhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity categories of the relational model, one per snapshot payload key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    Tactic,
    Technique,
    Subtechnique,
    Actor,
    ActorTechnique,
    Tag,
    ToolCategory,
    Tool,
    LogSource,
    Target,
    Operation,
    Step,
    Outcome,
    Layout,
    Account,
    AccessGroup,
    Membership,
    Credential,
}

impl Category {
    pub const ALL: [Self; 18] = [
        Self::Tactic,
        Self::Technique,
        Self::Subtechnique,
        Self::Actor,
        Self::ActorTechnique,
        Self::Tag,
        Self::ToolCategory,
        Self::Tool,
        Self::LogSource,
        Self::Target,
        Self::Operation,
        Self::Step,
        Self::Outcome,
        Self::Layout,
        Self::Account,
        Self::AccessGroup,
        Self::Membership,
        Self::Credential,
    ];

    /// Payload key under which this category's records appear in a snapshot.
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::Tactic => "tactics",
            Self::Technique => "techniques",
            Self::Subtechnique => "subtechniques",
            Self::Actor => "actors",
            Self::ActorTechnique => "actorTechniques",
            Self::Tag => "tags",
            Self::ToolCategory => "toolCategories",
            Self::Tool => "tools",
            Self::LogSource => "logSources",
            Self::Target => "targets",
            Self::Operation => "operations",
            Self::Step => "steps",
            Self::Outcome => "outcomes",
            Self::Layout => "layouts",
            Self::Account => "accounts",
            Self::AccessGroup => "accessGroups",
            Self::Membership => "memberships",
            Self::Credential => "credentials",
        }
    }

    #[must_use]
    pub fn scope(self) -> ScopeKind {
        match self {
            Self::Tactic | Self::Technique | Self::Subtechnique => ScopeKind::Taxonomy,
            Self::Actor
            | Self::ActorTechnique
            | Self::Tag
            | Self::ToolCategory
            | Self::Tool
            | Self::LogSource
            | Self::Target
            | Self::Operation
            | Self::Step
            | Self::Outcome
            | Self::Layout => ScopeKind::CaseData,
            Self::Account | Self::AccessGroup | Self::Membership | Self::Credential => {
                ScopeKind::Accounts
            }
        }
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Safe-to-delete ordering: every category appears before the categories its
/// rows hold foreign keys into. Creation order is this list reversed. Both the
/// clear planner and the restore orchestrator consume this table; no call site
/// re-derives ordering.
pub const DELETION_ORDER: [Category; 18] = [
    Category::Outcome,
    Category::Step,
    Category::Layout,
    Category::Operation,
    Category::Tool,
    Category::ToolCategory,
    Category::LogSource,
    Category::Tag,
    Category::Target,
    Category::ActorTechnique,
    Category::Actor,
    Category::Subtechnique,
    Category::Technique,
    Category::Tactic,
    Category::Membership,
    Category::Credential,
    Category::AccessGroup,
    Category::Account,
];

/// Deletion order restricted to the selected scope.
#[must_use]
pub fn deletion_order(scope: ScopeFlags) -> Vec<Category> {
    DELETION_ORDER.into_iter().filter(|category| scope.includes(*category)).collect()
}

/// Creation order restricted to the selected scope: parents before children.
#[must_use]
pub fn creation_order(scope: ScopeFlags) -> Vec<Category> {
    DELETION_ORDER.into_iter().rev().filter(|category| scope.includes(*category)).collect()
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScopeKind {
    Taxonomy,
    CaseData,
    Accounts,
}

/// Caller-selected slice of the data model a backup or restore touches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScopeFlags {
    #[serde(default)]
    pub taxonomy: bool,
    #[serde(default)]
    pub case_data: bool,
    #[serde(default)]
    pub accounts: bool,
}

impl ScopeFlags {
    #[must_use]
    pub fn full() -> Self {
        Self { taxonomy: true, case_data: true, accounts: true }
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        !self.taxonomy && !self.case_data && !self.accounts
    }

    #[must_use]
    pub fn includes(self, category: Category) -> bool {
        match category.scope() {
            ScopeKind::Taxonomy => self.taxonomy,
            ScopeKind::CaseData => self.case_data,
            ScopeKind::Accounts => self.accounts,
        }
    }
}

/// Mint a fresh row identifier. Strictly created rows always receive a new id
/// on restore; snapshot ids are resolved through the restore id map instead of
/// being written back.
#[must_use]
pub fn mint_id() -> String {
    Ulid::new().to_string()
}

fn default_true() -> bool {
    true
}

/// Lenient timestamp (de)serialization for snapshot fields: RFC 3339 or a bare
/// `YYYY-MM-DD` date, which older exports used for scheduling fields.
pub mod flexible_timestamp {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    #[must_use]
    pub fn parse(raw: &str) -> Option<OffsetDateTime> {
        if let Ok(value) = OffsetDateTime::parse(raw, &Rfc3339) {
            return Some(value);
        }
        let mut parts = raw.splitn(3, '-');
        let year = parts.next()?.parse::<i32>().ok()?;
        let month = parts.next()?.parse::<u8>().ok()?;
        let day = parts.next()?.parse::<u8>().ok()?;
        let month = time::Month::try_from(month).ok()?;
        let date = time::Date::from_calendar_date(year, month, day).ok()?;
        Some(date.midnight().assume_utc())
    }

    /// # Errors
    /// Returns a serialization error when the timestamp cannot be formatted.
    pub fn serialize<S>(value: &Option<OffsetDateTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(timestamp) => {
                let text = timestamp.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
                serializer.serialize_some(&text)
            }
            None => serializer.serialize_none(),
        }
    }

    /// # Errors
    /// Returns a deserialization error when a present value is neither RFC 3339
    /// nor a bare date.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(raw) => parse(&raw).map(Some).ok_or_else(|| {
                serde::de::Error::custom(format!(
                    "invalid timestamp `{raw}`: expected RFC 3339 or YYYY-MM-DD"
                ))
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum OperationStatus {
    Planned,
    Active,
    Complete,
}

impl OperationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Active => "active",
            Self::Complete => "complete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "planned" => Some(Self::Planned),
            "active" => Some(Self::Active),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum Visibility {
    Open,
    Restricted,
}

impl Visibility {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Restricted => "restricted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "restricted" => Some(Self::Restricted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    Pending,
    InProgress,
    Done,
}

impl StepStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "inProgress",
            Self::Done => "done",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "inProgress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum Verdict {
    Prevented,
    Detected,
    Logged,
    Missed,
}

impl Verdict {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prevented => "prevented",
            Self::Detected => "detected",
            Self::Logged => "logged",
            Self::Missed => "missed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "prevented" => Some(Self::Prevented),
            "detected" => Some(Self::Detected),
            "logged" => Some(Self::Logged),
            "missed" => Some(Self::Missed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum AccountRole {
    Admin,
    Operator,
    Viewer,
}

impl AccountRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Operator => "operator",
            Self::Viewer => "viewer",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Self::Admin),
            "operator" => Some(Self::Operator),
            "viewer" => Some(Self::Viewer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tactic {
    pub id: String,
    pub external_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Technique {
    pub id: String,
    pub external_id: String,
    pub name: String,
    pub tactic_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subtechnique {
    pub id: String,
    pub external_id: String,
    pub name: String,
    pub technique_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Flat Actor↔Technique link, replayed against freshly created actor ids on
/// restore. The only many-to-many relationship serialized as a standalone
/// category rather than an embedded id list.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActorTechnique {
    pub actor_id: String,
    pub technique_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCategory {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub id: String,
    pub name: String,
    pub category_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogSource {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub platform: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: OperationStatus,
    pub visibility: Visibility,
    #[serde(default)]
    pub access_group_ids: Vec<String>,
    #[serde(default)]
    pub tag_ids: Vec<String>,
    #[serde(default)]
    pub target_ids: Vec<String>,
    #[serde(default, with = "crate::flexible_timestamp")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "crate::flexible_timestamp")]
    pub ended_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetAssignment {
    pub target_id: String,
    pub in_scope: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub operation_id: String,
    pub name: String,
    pub status: StepStatus,
    #[serde(default)]
    pub tool_ids: Vec<String>,
    #[serde(default)]
    pub targets: Vec<TargetAssignment>,
    #[serde(default, with = "crate::flexible_timestamp")]
    pub executed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub id: String,
    pub step_id: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub tool_ids: Vec<String>,
    #[serde(default)]
    pub log_source_ids: Vec<String>,
    #[serde(default, with = "crate::flexible_timestamp")]
    pub recorded_at: Option<OffsetDateTime>,
}

/// Denormalized board projection of one operation, keyed 1:1 by the owning
/// operation. Re-applying it is legitimate, so restore upserts rather than
/// strictly creating.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationLayout {
    pub operation_id: String,
    #[serde(default)]
    pub column_order: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub role: AccountRole,
    #[serde(default = "crate::default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub account_id: String,
    pub access_group_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: String,
    pub account_id: String,
    pub username: String,
    pub secret: String,
}

fn require(category: Category, field: &str, value: &str) -> Result<(), SnapshotError> {
    if value.trim().is_empty() {
        return Err(SnapshotError::SchemaViolation {
            category,
            detail: format!("{field} MUST be non-empty"),
        });
    }
    Ok(())
}

impl Tactic {
    /// # Errors
    /// Returns [`SnapshotError::SchemaViolation`] when a required field is missing.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        require(Category::Tactic, "externalId", &self.external_id)?;
        require(Category::Tactic, "name", &self.name)
    }
}

impl Technique {
    /// # Errors
    /// Returns [`SnapshotError::SchemaViolation`] when a required field is missing.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        require(Category::Technique, "externalId", &self.external_id)?;
        require(Category::Technique, "name", &self.name)?;
        require(Category::Technique, "tacticId", &self.tactic_id)
    }
}

impl Subtechnique {
    /// # Errors
    /// Returns [`SnapshotError::SchemaViolation`] when a required field is missing.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        require(Category::Subtechnique, "externalId", &self.external_id)?;
        require(Category::Subtechnique, "name", &self.name)?;
        require(Category::Subtechnique, "techniqueId", &self.technique_id)
    }
}

impl Actor {
    /// # Errors
    /// Returns [`SnapshotError::SchemaViolation`] when a required field is missing.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        require(Category::Actor, "name", &self.name)
    }
}

impl ActorTechnique {
    /// # Errors
    /// Returns [`SnapshotError::SchemaViolation`] when either side of the link is missing.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        require(Category::ActorTechnique, "actorId", &self.actor_id)?;
        require(Category::ActorTechnique, "techniqueId", &self.technique_id)
    }
}

impl Tag {
    /// # Errors
    /// Returns [`SnapshotError::SchemaViolation`] when a required field is missing.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        require(Category::Tag, "name", &self.name)
    }
}

impl ToolCategory {
    /// # Errors
    /// Returns [`SnapshotError::SchemaViolation`] when a required field is missing.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        require(Category::ToolCategory, "name", &self.name)
    }
}

impl Tool {
    /// # Errors
    /// Returns [`SnapshotError::SchemaViolation`] when a required field is missing.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        require(Category::Tool, "name", &self.name)?;
        require(Category::Tool, "categoryId", &self.category_id)
    }
}

impl LogSource {
    /// # Errors
    /// Returns [`SnapshotError::SchemaViolation`] when a required field is missing.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        require(Category::LogSource, "name", &self.name)
    }
}

impl Target {
    /// # Errors
    /// Returns [`SnapshotError::SchemaViolation`] when a required field is missing.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        require(Category::Target, "name", &self.name)
    }
}

impl Operation {
    /// # Errors
    /// Returns [`SnapshotError::SchemaViolation`] when a required field is
    /// missing, or when restricted visibility names no access group.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        require(Category::Operation, "name", &self.name)?;
        if self.visibility == Visibility::Restricted && self.access_group_ids.is_empty() {
            return Err(SnapshotError::SchemaViolation {
                category: Category::Operation,
                detail: "accessGroupIds MUST name at least one access group when visibility is restricted"
                    .to_string(),
            });
        }
        Ok(())
    }
}

impl Step {
    /// # Errors
    /// Returns [`SnapshotError::SchemaViolation`] when a required field is missing.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        require(Category::Step, "operationId", &self.operation_id)?;
        require(Category::Step, "name", &self.name)
    }
}

impl Outcome {
    /// # Errors
    /// Returns [`SnapshotError::SchemaViolation`] when a required field is missing.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        require(Category::Outcome, "stepId", &self.step_id)
    }
}

impl OperationLayout {
    /// # Errors
    /// Returns [`SnapshotError::SchemaViolation`] when a required field is missing.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        require(Category::Layout, "operationId", &self.operation_id)
    }
}

impl Account {
    /// # Errors
    /// Returns [`SnapshotError::SchemaViolation`] when the natural key is unusable.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        require(Category::Account, "email", &self.email)?;
        if !self.email.contains('@') {
            return Err(SnapshotError::SchemaViolation {
                category: Category::Account,
                detail: format!("email `{}` MUST be an address", self.email),
            });
        }
        require(Category::Account, "displayName", &self.display_name)
    }
}

impl AccessGroup {
    /// # Errors
    /// Returns [`SnapshotError::SchemaViolation`] when the natural key is missing.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        require(Category::AccessGroup, "name", &self.name)
    }
}

impl Membership {
    /// # Errors
    /// Returns [`SnapshotError::SchemaViolation`] when either side of the link is missing.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        require(Category::Membership, "accountId", &self.account_id)?;
        require(Category::Membership, "accessGroupId", &self.access_group_id)
    }
}

impl Credential {
    /// # Errors
    /// Returns [`SnapshotError::SchemaViolation`] when a required field is missing.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        require(Category::Credential, "accountId", &self.account_id)?;
        require(Category::Credential, "username", &self.username)
    }
}

/// Category→records mapping of one snapshot. An absent category means "do not
/// touch that category", never "delete it".
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tactics: Option<Vec<Tactic>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub techniques: Option<Vec<Technique>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtechniques: Option<Vec<Subtechnique>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actors: Option<Vec<Actor>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_techniques: Option<Vec<ActorTechnique>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<Tag>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_categories: Option<Vec<ToolCategory>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_sources: Option<Vec<LogSource>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<Target>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<Operation>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<Step>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcomes: Option<Vec<Outcome>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layouts: Option<Vec<OperationLayout>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accounts: Option<Vec<Account>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_groups: Option<Vec<AccessGroup>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memberships: Option<Vec<Membership>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Vec<Credential>>,
}

fn take_category<T: DeserializeOwned>(
    map: &mut serde_json::Map<String, Value>,
    category: Category,
) -> Result<Option<Vec<T>>, SnapshotError> {
    match map.remove(category.key()) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value).map(Some).map_err(|err| {
            SnapshotError::SchemaViolation { category, detail: err.to_string() }
        }),
    }
}

impl SnapshotPayload {
    /// Decode a payload object category by category so that a schema failure
    /// names the category it occurred in. Unknown keys are ignored.
    ///
    /// # Errors
    /// Returns [`SnapshotError::MissingPayload`] when the value is not an
    /// object, or [`SnapshotError::SchemaViolation`] when a present category
    /// fails to decode.
    pub fn from_value(value: Value) -> Result<Self, SnapshotError> {
        let Value::Object(mut map) = value else {
            return Err(SnapshotError::MissingPayload);
        };

        Ok(Self {
            tactics: take_category(&mut map, Category::Tactic)?,
            techniques: take_category(&mut map, Category::Technique)?,
            subtechniques: take_category(&mut map, Category::Subtechnique)?,
            actors: take_category(&mut map, Category::Actor)?,
            actor_techniques: take_category(&mut map, Category::ActorTechnique)?,
            tags: take_category(&mut map, Category::Tag)?,
            tool_categories: take_category(&mut map, Category::ToolCategory)?,
            tools: take_category(&mut map, Category::Tool)?,
            log_sources: take_category(&mut map, Category::LogSource)?,
            targets: take_category(&mut map, Category::Target)?,
            operations: take_category(&mut map, Category::Operation)?,
            steps: take_category(&mut map, Category::Step)?,
            outcomes: take_category(&mut map, Category::Outcome)?,
            layouts: take_category(&mut map, Category::Layout)?,
            accounts: take_category(&mut map, Category::Account)?,
            access_groups: take_category(&mut map, Category::AccessGroup)?,
            memberships: take_category(&mut map, Category::Membership)?,
            credentials: take_category(&mut map, Category::Credential)?,
        })
    }

    /// Field-level validation of every present category. Absent categories are
    /// skipped, not defaulted.
    ///
    /// # Errors
    /// Returns the first [`SnapshotError::SchemaViolation`] encountered.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        fn each<T>(
            records: Option<&Vec<T>>,
            validate: impl Fn(&T) -> Result<(), SnapshotError>,
        ) -> Result<(), SnapshotError> {
            if let Some(records) = records {
                for record in records {
                    validate(record)?;
                }
            }
            Ok(())
        }

        each(self.tactics.as_ref(), Tactic::validate)?;
        each(self.techniques.as_ref(), Technique::validate)?;
        each(self.subtechniques.as_ref(), Subtechnique::validate)?;
        each(self.actors.as_ref(), Actor::validate)?;
        each(self.actor_techniques.as_ref(), ActorTechnique::validate)?;
        each(self.tags.as_ref(), Tag::validate)?;
        each(self.tool_categories.as_ref(), ToolCategory::validate)?;
        each(self.tools.as_ref(), Tool::validate)?;
        each(self.log_sources.as_ref(), LogSource::validate)?;
        each(self.targets.as_ref(), Target::validate)?;
        each(self.operations.as_ref(), Operation::validate)?;
        each(self.steps.as_ref(), Step::validate)?;
        each(self.outcomes.as_ref(), Outcome::validate)?;
        each(self.layouts.as_ref(), OperationLayout::validate)?;
        each(self.accounts.as_ref(), Account::validate)?;
        each(self.access_groups.as_ref(), AccessGroup::validate)?;
        each(self.memberships.as_ref(), Membership::validate)?;
        each(self.credentials.as_ref(), Credential::validate)
    }

    /// Record count per present category, keyed by payload key.
    #[must_use]
    pub fn category_counts(&self) -> BTreeMap<String, usize> {
        fn count<T>(
            counts: &mut BTreeMap<String, usize>,
            category: Category,
            records: Option<&Vec<T>>,
        ) {
            if let Some(records) = records {
                counts.insert(category.key().to_string(), records.len());
            }
        }

        let mut counts = BTreeMap::new();
        count(&mut counts, Category::Tactic, self.tactics.as_ref());
        count(&mut counts, Category::Technique, self.techniques.as_ref());
        count(&mut counts, Category::Subtechnique, self.subtechniques.as_ref());
        count(&mut counts, Category::Actor, self.actors.as_ref());
        count(&mut counts, Category::ActorTechnique, self.actor_techniques.as_ref());
        count(&mut counts, Category::Tag, self.tags.as_ref());
        count(&mut counts, Category::ToolCategory, self.tool_categories.as_ref());
        count(&mut counts, Category::Tool, self.tools.as_ref());
        count(&mut counts, Category::LogSource, self.log_sources.as_ref());
        count(&mut counts, Category::Target, self.targets.as_ref());
        count(&mut counts, Category::Operation, self.operations.as_ref());
        count(&mut counts, Category::Step, self.steps.as_ref());
        count(&mut counts, Category::Outcome, self.outcomes.as_ref());
        count(&mut counts, Category::Layout, self.layouts.as_ref());
        count(&mut counts, Category::Account, self.accounts.as_ref());
        count(&mut counts, Category::AccessGroup, self.access_groups.as_ref());
        count(&mut counts, Category::Membership, self.memberships.as_ref());
        count(&mut counts, Category::Credential, self.credentials.as_ref());
        counts
    }
}

/// Versioned wrapper around one snapshot payload. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEnvelope {
    pub format_version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub payload: SnapshotPayload,
}

/// Which of the two historical snapshot shapes an input matched. Resolved
/// exactly once by [`parse_snapshot`]; restore logic never re-probes the text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotShape {
    Envelope,
    LegacyPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSnapshot {
    pub shape: SnapshotShape,
    pub format_version: Option<String>,
    pub generated_at: Option<OffsetDateTime>,
    pub payload: SnapshotPayload,
}

/// Parse and validate an untrusted snapshot string.
///
/// Accepts the current envelope shape `{formatVersion, generatedAt, payload}`
/// and the legacy bare-payload shape (the value *is* the payload). Both must
/// stay accepted indefinitely: previously exported files never expire.
///
/// # Errors
/// - [`SnapshotError::MalformedInput`] when the text is not JSON.
/// - [`SnapshotError::MissingPayload`] when neither shape matches.
/// - [`SnapshotError::SchemaViolation`] when a present category fails
///   field-level validation.
pub fn parse_snapshot(text: &str) -> Result<ParsedSnapshot, SnapshotError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|err| SnapshotError::MalformedInput(err.to_string()))?;
    let Value::Object(mut root) = value else {
        return Err(SnapshotError::MissingPayload);
    };

    let is_envelope = matches!(root.get("formatVersion"), Some(Value::String(_)))
        && matches!(root.get("payload"), Some(Value::Object(_)));
    if is_envelope {
        let format_version = match root.remove("formatVersion") {
            Some(Value::String(version)) => version,
            _ => return Err(SnapshotError::MissingPayload),
        };
        // generatedAt is provenance metadata, not a restore input; an
        // unparsable value is dropped rather than failing the snapshot.
        let generated_at = root
            .remove("generatedAt")
            .and_then(|value| value.as_str().and_then(flexible_timestamp::parse));
        let payload_value = match root.remove("payload") {
            Some(value) => value,
            None => return Err(SnapshotError::MissingPayload),
        };
        let payload = SnapshotPayload::from_value(payload_value)?;
        payload.validate()?;
        return Ok(ParsedSnapshot {
            shape: SnapshotShape::Envelope,
            format_version: Some(format_version),
            generated_at,
            payload,
        });
    }

    // Legacy shape: the object is the payload itself. It must carry at least
    // one known category key; an arbitrary object has no restorable intent.
    if Category::ALL.iter().any(|category| root.contains_key(category.key())) {
        let payload = SnapshotPayload::from_value(Value::Object(root))?;
        payload.validate()?;
        return Ok(ParsedSnapshot {
            shape: SnapshotShape::LegacyPayload,
            format_version: None,
            generated_at: None,
            payload,
        });
    }

    Err(SnapshotError::MissingPayload)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Backup,
    Restore,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }
}

/// Structured record of one backup or restore invocation: who ran what, over
/// which scope, and how it ended. The engine emits the payload; transport
/// belongs to the embedding application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub actor: String,
    pub action: AuditAction,
    pub scope: ScopeFlags,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl AuditEvent {
    #[must_use]
    pub fn ok(actor: &str, action: AuditAction, scope: ScopeFlags) -> Self {
        Self {
            actor: actor.to_string(),
            action,
            scope,
            occurred_at: OffsetDateTime::now_utc(),
            succeeded: true,
            failure: None,
        }
    }

    #[must_use]
    pub fn error(actor: &str, action: AuditAction, scope: ScopeFlags, reason: String) -> Self {
        Self {
            actor: actor.to_string(),
            action,
            scope,
            occurred_at: OffsetDateTime::now_utc(),
            succeeded: false,
            failure: Some(reason),
        }
    }
}

pub trait AuditSink {
    fn record(&self, event: &AuditEvent);
}

/// Sink for callers that discard audit events (tests, one-shot tooling).
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: &AuditEvent) {}
}

/// Baseline classification rows supplied by the external taxonomy provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaxonomyBaseline {
    #[serde(default)]
    pub tactics: Vec<Tactic>,
    #[serde(default)]
    pub techniques: Vec<Technique>,
    #[serde(default)]
    pub subtechniques: Vec<Subtechnique>,
}
