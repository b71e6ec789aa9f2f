pub mod auth;
pub mod casework;
pub mod clock;
pub mod config;
pub mod disambiguation;
pub mod domain;
pub mod envelope;
pub mod errors;
pub mod gateway;
pub mod governor;
pub mod guard;
pub mod query;
pub mod risk;
pub mod sandbox;
pub mod writeback;

pub use auth::{AccessCredential, AuthContext, AuthContextResolver, AuthError, RefreshedToken, TokenRefresher};
pub use casework::{summarize_queue, CaseQueueSummary};
pub use clock::{Clock, ManualClock, SystemClock};
pub use disambiguation::{Disambiguate, DisambiguationCandidate, DisambiguationResolver, Resolution};
pub use domain::idempotency::{DedupKey, IdempotencyRecord, IdempotencyState, ResultRef};
pub use domain::records::{CrmRecord, FromCrmRecord, NormalizeError};
pub use domain::session::{SessionContext, SessionId, UserId};
pub use envelope::{ToolResponse, Warning};
pub use errors::{StoreError, ToolError, ToolErrorCode};
pub use gateway::{CrmGateway, Filter, FilterValue, GatewayError, OrderBy, QuerySpec, SearchRequest};
pub use governor::{
    InMemoryRateCounterStore, QuotaWindow, RateAdvisory, RateCounter, RateCounterStore, RateDecision,
    SessionRateGovernor, SessionUsage,
};
pub use guard::{CallError, CallScope, GovernedGateway};
pub use query::{QueryError, QueryExecutor, QueryResult, SearchStrategy, TextSearch, MAX_QUERY_ROWS};
pub use risk::{PipelineSummary, RiskAnalysisEngine, RiskFlag, RiskFlagKind};
pub use writeback::{
    IdempotencyStore, InMemoryIdempotencyStore, Mutation, Reservation, WriteBackGate, WriteError,
    WriteOutcome, WritePlan, WriteReceipt, WriteRequest,
};
