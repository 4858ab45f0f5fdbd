//! Plain-text dashboard

use crate::read_model::ReadModel;
use crate::session::SessionSnapshot;
use crate::types::{network_name, Metric, SessionState};
use ethers::types::Address;
use std::fmt;

/// One rendered metric line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLine {
    pub metric: Metric,
    pub value: String,
    pub failed: bool,
}

/// Session header plus the polled values, captured at one instant
#[derive(Debug, Clone)]
pub struct Dashboard {
    pub state: SessionState,
    pub account: Option<Address>,
    pub network: &'static str,
    pub lines: Vec<MetricLine>,
}

impl Dashboard {
    pub fn capture(snapshot: &SessionSnapshot, model: &ReadModel) -> Self {
        let lines = model
            .metrics()
            .iter()
            .map(|metric| {
                let entry = model.entry(*metric);
                MetricLine {
                    metric: *metric,
                    value: model.display(*metric),
                    failed: entry.map_or(false, |e| e.last_error.is_some()),
                }
            })
            .collect();

        Self {
            state: snapshot.state,
            account: snapshot.account,
            network: network_name(snapshot.chain_id),
            lines,
        }
    }

    /// Navigation-bar account label
    pub fn account_label(&self) -> String {
        match self.account {
            Some(account) if self.state.is_connected() => format!("{:?}", account),
            _ => "Connect Account".to_string(),
        }
    }
}

impl fmt::Display for Dashboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Account: {}", self.account_label())?;
        writeln!(f, "Network: {}", self.network)?;
        if self.state != SessionState::Connected {
            writeln!(f, "Status: {:?}", self.state)?;
        }
        for line in &self.lines {
            let unit = if line.metric == Metric::RewardRate { " token/sec" } else { "" };
            let marker = if line.failed { " (last read failed)" } else { "" };
            writeln!(f, "{}: {}{}{}", line.metric.label(), line.value, unit, marker)?;
        }
        Ok(())
    }
}
