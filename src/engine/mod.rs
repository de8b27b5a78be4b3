pub mod dispatch;
pub mod exits;
pub mod exposure;
pub mod fsm;
pub mod gates;
pub mod params;
pub mod reconcile;
pub mod regime;
pub mod scanner;
pub mod sizing;
pub mod state;
pub mod universe;

pub use exposure::SectorExposure;
pub use regime::MarketProgramRegime;
pub use state::{FsmState, SymbolState};
