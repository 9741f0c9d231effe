//! Document transformation scripts
//!
//! Each `Transformation` is compiled once into a sandboxed `rhai` program. The
//! mutated document is bound as `this` and the script hands results to the
//! broker through the `loadTo<Queue>(...)` emit functions:
//!
//! ```text
//! let order = #{ Id: id(this), OrderLinesCount: this.Lines.len(), TotalCost: 0.0 };
//! for line in this.Lines {
//!     order.TotalCost += line.Quantity * line.PricePerUnit * (1.0 - line.Discount);
//! }
//! loadToOrders(order, #{ Id: id(this), PartitionKey: id(this), Type: "com.github.users" });
//! ```
//!
//! The sandbox exposes no filesystem, network, clock or randomness, so a run
//! depends only on the event it is given.

pub mod engine;
pub mod message;

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

pub use engine::TransformEngine;
pub use message::Emit;

/// Prefix of the per-destination emit functions.
pub const EMIT_PREFIX: &str = "loadTo";

fn destination_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\bloadTo([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("destination pattern is valid")
    })
}

/// Destinations a script emits to through `loadTo<Name>(...)` calls.
pub fn discover_destinations(script: &str) -> BTreeSet<String> {
    destination_pattern()
        .captures_iter(script)
        .filter_map(|captures| captures.get(1))
        .map(|name| name.as_str().to_string())
        .collect()
}
