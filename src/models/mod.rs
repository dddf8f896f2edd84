pub mod job;
pub mod node;
pub mod object;
pub mod plan;
pub mod rule;

pub use job::{DispatchReport, ForwardJob, JobOutcome, PlanOutcome, SendFailure, SentObject};
pub use node::Node;
pub use object::{DicomObject, Modality, ObjectError};
pub use plan::{Origin, Plan, PlanKey, PlanState, LOCAL_IMPORT_IDENTITY};
pub use rule::Rule;
