//! The runtime shims evaluated into every fresh VM.
//!
//! Installation order matters (`EventTarget` before anything that
//! dispatches events, the body classes before `fetch`, everything
//! after `bootstrap`), so each shim declares its dependencies and the
//! install order is a topological sort, stable with respect to the
//! declaration order below so unrelated shims keep a deterministic
//! sequence.

use std::collections::{HashMap, VecDeque};

use crate::error::{VmError, VmResult};

pub(crate) struct Shim {
    pub name: &'static str,
    pub deps: &'static [&'static str],
    pub source: &'static str,
}

pub(crate) static SHIMS: &[Shim] = &[
    Shim {
        name: "bootstrap",
        deps: &[],
        source: include_str!("js/bootstrap.js"),
    },
    Shim {
        name: "event-target",
        deps: &["bootstrap"],
        source: include_str!("js/event_target.js"),
    },
    Shim {
        name: "encoding",
        deps: &["bootstrap"],
        source: include_str!("js/encoding.js"),
    },
    Shim {
        name: "console",
        deps: &["bootstrap"],
        source: include_str!("js/console.js"),
    },
    Shim {
        name: "timers",
        deps: &["bootstrap"],
        source: include_str!("js/timers.js"),
    },
    Shim {
        name: "url",
        deps: &["bootstrap"],
        source: include_str!("js/url.js"),
    },
    Shim {
        name: "performance",
        deps: &["bootstrap", "encoding"],
        source: include_str!("js/performance.js"),
    },
    Shim {
        name: "headers",
        deps: &["bootstrap"],
        source: include_str!("js/headers.js"),
    },
    Shim {
        name: "http",
        deps: &["headers", "encoding", "event-target"],
        source: include_str!("js/http.js"),
    },
    Shim {
        name: "fetch",
        deps: &["http", "url"],
        source: include_str!("js/fetch.js"),
    },
    Shim {
        name: "crypto",
        deps: &["encoding"],
        source: include_str!("js/crypto.js"),
    },
    Shim {
        name: "compression",
        deps: &["encoding"],
        source: include_str!("js/compression.js"),
    },
    Shim {
        name: "websocket",
        deps: &["event-target", "encoding"],
        source: include_str!("js/websocket.js"),
    },
    Shim {
        name: "socket",
        deps: &["encoding"],
        source: include_str!("js/socket.js"),
    },
    Shim {
        name: "env",
        deps: &["http", "fetch"],
        source: include_str!("js/env.js"),
    },
];

/// Kahn's algorithm over the declared dependencies, breaking ties by
/// declaration order.
pub(crate) fn install_order() -> VmResult<Vec<&'static Shim>> {
    let index: HashMap<&str, usize> = SHIMS
        .iter()
        .enumerate()
        .map(|(i, shim)| (shim.name, i))
        .collect();

    let mut blocked_on = vec![0usize; SHIMS.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); SHIMS.len()];
    for (i, shim) in SHIMS.iter().enumerate() {
        for dep in shim.deps {
            let Some(&d) = index.get(dep) else {
                return Err(VmError::create(format!(
                    "shim '{}' depends on unknown shim '{dep}'",
                    shim.name
                )));
            };
            blocked_on[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut queue: VecDeque<usize> = (0..SHIMS.len()).filter(|&i| blocked_on[i] == 0).collect();
    let mut order = Vec::with_capacity(SHIMS.len());
    while let Some(i) = queue.pop_front() {
        order.push(&SHIMS[i]);
        for &dependent in &dependents[i] {
            blocked_on[dependent] -= 1;
            if blocked_on[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if order.len() != SHIMS.len() {
        return Err(VmError::create("shim dependency cycle".to_string()));
    }
    Ok(order)
}
