#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_wraps,
)]

use clap::Subcommand;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod context;
pub mod engine;
pub mod gateway;
pub mod kv;
pub mod lock;
pub mod observability;
pub mod queue;
pub mod record;
pub mod sessions;
pub(crate) mod util;

pub use config::TurnstileConfig;
pub use sessions::{HandleOutcome, InboundMessage, SessionOrchestrator};

/// Session inspection subcommands
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionCommands {
    /// Print everything stored for one session as JSON
    Show {
        /// Tenant (business) id
        tenant: String,
        /// Contact (customer) id
        contact: String,
    },
    /// Delete every key of one session, lock and queue included
    #[command(long_about = "\
Delete every stored key of one session.

Removes the persistent cache, active task state, lock, queue and \
new-messages marker. A cycle still running for the session loses its \
lock and discards its writes.

Examples:
  turnstile session clear 74274 12345
  turnstile session clear 74274 12345 --yes")]
    Clear {
        tenant: String,
        contact: String,
        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}
