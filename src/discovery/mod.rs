//! Discovery Engine
//!
//! The resumable machine stack and every machine that runs on it, from
//! expander enumeration through route programming, device bring-up and
//! reconciliation.

pub mod boundary;
pub mod bringup;
pub mod config;
pub mod config_set;
pub mod context;
pub mod expander;
pub mod quirks;
pub mod reconcile;
pub mod routing;
pub mod session;
pub mod stack;

pub use boundary::{find_subtractive_phy, Boundary, FindBoundary};
pub use config::{DiscoveryConfig, RouteAlgorithm};
pub use context::{Advisory, Context, IoRequest, PortDescriptor, RequestKind, SessionState};
pub use expander::{DiscoverExpander, ExpanderArgs, MAX_EXPANDER_PHYS};
pub use quirks::{QuirkAction, QuirkHook, VitesseSesQuirk};
pub use reconcile::reconcile;
pub use session::DiscoverySession;
pub use stack::{Machine, MachineStack, Output, StackStatus, StateMachine, Step, Wake};
