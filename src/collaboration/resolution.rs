//! Resolution policies for reconciling divergent PARALLEL/SWARM outputs,
//! per spec §4.3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{default_equivalence, equivalence_classes, ParticipantOutput};

/// A custom "do these two outputs agree" predicate, supplied per request.
/// Defaults to byte-identical comparison after normalization.
pub type EquivalenceFn = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

pub fn default_equivalence_fn() -> EquivalenceFn {
    Arc::new(default_equivalence)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionPolicy {
    Voting,
    ConfidenceWeighted,
    ExpertiseWeighted,
    Consensus,
    Arbitration,
    Human,
}

const CONSENSUS_THRESHOLD: f64 = 0.66;

/// Reconcile `outputs` under `policy`. Returns the chosen output (if the
/// policy resolves one directly), the policy actually applied (may differ
/// from the requested one when a tie or timeout falls through to
/// `ARBITRATION`), and the winning equivalence class's representative
/// content, for the `resolution_chosen` event.
pub fn resolve(
    policy: &ResolutionPolicy,
    outputs: &[ParticipantOutput],
    _deadline: Option<DateTime<Utc>>,
) -> (Option<ParticipantOutput>, ResolutionPolicy, Option<String>) {
    let equivalence_fn = default_equivalence_fn();
    let classes = equivalence_classes(outputs, &equivalence_fn);

    match policy {
        ResolutionPolicy::Voting => {
            let mut best: Option<(usize, &Vec<&ParticipantOutput>)> = None;
            let mut tied = false;
            for class in &classes {
                match best {
                    None => best = Some((class.len(), class)),
                    Some((count, _)) if class.len() > count => {
                        best = Some((class.len(), class));
                        tied = false;
                    }
                    Some((count, _)) if class.len() == count => tied = true,
                    _ => {}
                }
            }
            match best {
                Some((_, class)) if !tied => {
                    let rep = class[0].clone();
                    let label = rep.content.clone();
                    (Some(rep), ResolutionPolicy::Voting, Some(label))
                }
                _ => (None, ResolutionPolicy::Arbitration, None),
            }
        }
        ResolutionPolicy::ConfidenceWeighted => {
            let mut best: Option<&ParticipantOutput> = None;
            let mut tied = false;
            for output in outputs {
                match best {
                    None => best = Some(output),
                    Some(b) if output.confidence > b.confidence => {
                        best = Some(output);
                        tied = false;
                    }
                    Some(b) if (output.confidence - b.confidence).abs() < f64::EPSILON => tied = true,
                    _ => {}
                }
            }
            match best {
                Some(out) if !tied => {
                    let label = out.content.clone();
                    (Some(out.clone()), ResolutionPolicy::ConfidenceWeighted, Some(label))
                }
                _ => (None, ResolutionPolicy::Arbitration, None),
            }
        }
        ResolutionPolicy::ExpertiseWeighted => {
            let mut best: Option<(&Vec<&ParticipantOutput>, f64)> = None;
            let mut tied = false;
            for class in &classes {
                let weight: f64 = class.iter().map(|o| o.expertise_weight).sum();
                match best {
                    None => best = Some((class, weight)),
                    Some((_, w)) if weight > w => {
                        best = Some((class, weight));
                        tied = false;
                    }
                    Some((_, w)) if (weight - w).abs() < f64::EPSILON => tied = true,
                    _ => {}
                }
            }
            match best {
                Some((class, _)) if !tied => {
                    let rep = class[0].clone();
                    let label = rep.content.clone();
                    (Some(rep), ResolutionPolicy::ExpertiseWeighted, Some(label))
                }
                _ => (None, ResolutionPolicy::Arbitration, None),
            }
        }
        ResolutionPolicy::Consensus => {
            let total = outputs.len() as f64;
            let mut best: Option<(&Vec<&ParticipantOutput>, f64)> = None;
            for class in &classes {
                let weight = class.len() as f64 / total;
                if weight >= CONSENSUS_THRESHOLD && best.as_ref().map(|(_, w)| weight > *w).unwrap_or(true) {
                    best = Some((class, weight));
                }
            }
            match best {
                Some((class, _)) => {
                    let rep = class[0].clone();
                    let label = rep.content.clone();
                    (Some(rep), ResolutionPolicy::Consensus, Some(label))
                }
                None => (None, ResolutionPolicy::Arbitration, None),
            }
        }
        ResolutionPolicy::Arbitration => (None, ResolutionPolicy::Arbitration, None),
        // The engine owns the real suspend/await/timeout behavior (it holds
        // the oneshot registry and can emit `awaiting_human`); this layer
        // only reports that a human decision is what's being requested.
        ResolutionPolicy::Human => (None, ResolutionPolicy::Human, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(agent: &str, content: &str, confidence: f64) -> ParticipantOutput {
        weighted_output(agent, content, confidence, 1.0)
    }

    fn weighted_output(agent: &str, content: &str, confidence: f64, expertise_weight: f64) -> ParticipantOutput {
        ParticipantOutput {
            agent_id: agent.to_string(),
            content: content.to_string(),
            confidence,
            expertise_weight,
            stop: false,
        }
    }

    #[test]
    fn consensus_picks_class_at_or_above_threshold() {
        let outputs = vec![
            output("a", "X", 1.0),
            output("b", "X", 1.0),
            output("c", "Y", 1.0),
        ];
        let (chosen, policy, class) = resolve(&ResolutionPolicy::Consensus, &outputs, None);
        assert_eq!(policy, ResolutionPolicy::Consensus);
        assert_eq!(chosen.unwrap().content, "X");
        assert_eq!(class.as_deref(), Some("X"));
    }

    #[test]
    fn consensus_falls_back_to_arbitration_below_threshold() {
        let outputs = vec![output("a", "X", 1.0), output("b", "Y", 1.0)];
        let (chosen, policy, _) = resolve(&ResolutionPolicy::Consensus, &outputs, None);
        assert!(chosen.is_none());
        assert_eq!(policy, ResolutionPolicy::Arbitration);
    }

    #[test]
    fn voting_tie_falls_back_to_arbitration() {
        let outputs = vec![output("a", "X", 1.0), output("b", "Y", 1.0)];
        let (chosen, policy, _) = resolve(&ResolutionPolicy::Voting, &outputs, None);
        assert!(chosen.is_none());
        assert_eq!(policy, ResolutionPolicy::Arbitration);
    }

    #[test]
    fn confidence_weighted_picks_argmax() {
        let outputs = vec![output("a", "X", 0.4), output("b", "Y", 0.9)];
        let (chosen, policy, _) = resolve(&ResolutionPolicy::ConfidenceWeighted, &outputs, None);
        assert_eq!(policy, ResolutionPolicy::ConfidenceWeighted);
        assert_eq!(chosen.unwrap().agent_id, "b");
    }

    #[test]
    fn expertise_weighted_picks_the_class_with_the_highest_summed_weight() {
        // "Y" has one low-weight voter; "X" has two low-weight voters whose
        // combined weight still loses to a single high-expertise "Y" voter.
        let outputs = vec![
            weighted_output("a", "X", 1.0, 0.5),
            weighted_output("b", "X", 1.0, 0.5),
            weighted_output("c", "Y", 1.0, 2.0),
        ];
        let (chosen, policy, class) = resolve(&ResolutionPolicy::ExpertiseWeighted, &outputs, None);
        assert_eq!(policy, ResolutionPolicy::ExpertiseWeighted);
        assert_eq!(chosen.unwrap().content, "Y");
        assert_eq!(class.as_deref(), Some("Y"));
    }

    #[test]
    fn expertise_weighted_tie_falls_back_to_arbitration() {
        let outputs = vec![weighted_output("a", "X", 1.0, 1.0), weighted_output("b", "Y", 1.0, 1.0)];
        let (chosen, policy, _) = resolve(&ResolutionPolicy::ExpertiseWeighted, &outputs, None);
        assert!(chosen.is_none());
        assert_eq!(policy, ResolutionPolicy::Arbitration);
    }

    #[test]
    fn human_resolution_always_reports_human_without_choosing_here() {
        // The engine, not `resolve`, owns the suspend/await/timeout dance;
        // this layer only signals that a human decision is requested.
        let outputs = vec![output("a", "X", 1.0)];
        let (chosen, policy, _) = resolve(&ResolutionPolicy::Human, &outputs, None);
        assert!(chosen.is_none());
        assert_eq!(policy, ResolutionPolicy::Human);
    }
}
