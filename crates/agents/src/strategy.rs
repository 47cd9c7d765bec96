//! Negotiation strategies.
//!
//! A strategy decides how an agent answers an incoming offer and whether it
//! opens negotiations on its own. Strategies are looked up by name through
//! [`from_name`].

use negotopo_core::{AgentId, NegotiationError, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};

pub const DEFAULT_STRATEGY: &str = "cooperative";
pub const STRATEGY_NAMES: [&str; 4] = ["cooperative", "competitive", "random", "reject"];

/// Minimum need/offer similarity for an offer to count as a match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;

fn words(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty())
}

/// String similarity between a need and an offered value, in `[0, 1]`.
///
/// Case-insensitive equality scores 1.0, containment 0.8, otherwise the
/// Jaccard overlap of the word sets.
pub fn similarity(a: &str, b: &str) -> f32 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    if a.contains(&b) || b.contains(&a) {
        return 0.8;
    }
    let wa: std::collections::HashSet<&str> = words(&a).collect();
    let wb: std::collections::HashSet<&str> = words(&b).collect();
    let union = wa.union(&wb).count();
    if union == 0 {
        return 0.0;
    }
    wa.intersection(&wb).count() as f32 / union as f32
}

#[derive(Clone, Debug, PartialEq)]
pub struct NeedMatch {
    pub index: usize,
    pub need: String,
    pub score: f32,
}

/// Highest-scoring need for `offer`, if it reaches `threshold`.
/// Earlier needs win ties.
pub fn best_need_match(needs: &[String], offer: &str, threshold: f32) -> Option<NeedMatch> {
    let mut best: Option<NeedMatch> = None;
    for (index, need) in needs.iter().enumerate() {
        let score = similarity(need, offer);
        if score >= threshold && best.as_ref().map_or(true, |b| score > b.score) {
            best = Some(NeedMatch {
                index,
                need: need.clone(),
                score,
            });
        }
    }
    best
}

/// Picks the offer that best fits `peer_needs`, rotating by round when
/// nothing fits.
pub fn choose_offer(offers: &[String], peer_needs: &[String], round: usize) -> Option<String> {
    if offers.is_empty() {
        return None;
    }
    let scored = offers.iter().map(|o| {
        let fit = peer_needs
            .iter()
            .map(|n| similarity(n, o))
            .fold(0.0f32, f32::max);
        (o, fit)
    });
    let mut best: Option<(&String, f32)> = None;
    for (offer, fit) in scored {
        if fit > best.map_or(0.0, |b| b.1) {
            best = Some((offer, fit));
        }
    }
    Some(
        best.map(|(o, _)| o.clone())
            .unwrap_or_else(|| offers[round % offers.len()].clone()),
    )
}

pub struct StrategyContext<'a> {
    pub agent_needs: &'a [String],
    pub agent_offers: &'a [String],
    pub incoming_offer: Option<&'a str>,
    pub round: usize,
    pub peer: Option<&'a AgentId>,
    /// What the agent believes the peer needs, if it has been told.
    pub peer_needs: &'a [String],
    pub best_match: Option<&'a NeedMatch>,
    /// The incoming value is itself a counter, so countering again is not allowed.
    pub replying_to_counter: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Accept,
    Reject,
    Counter,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub counter_offer: Option<String>,
    pub reason: String,
}

impl Decision {
    pub fn accept(reason: impl Into<String>) -> Self {
        Self {
            action: Action::Accept,
            counter_offer: None,
            reason: reason.into(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            action: Action::Reject,
            counter_offer: None,
            reason: reason.into(),
        }
    }

    pub fn counter(offer: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            action: Action::Counter,
            counter_offer: offer,
            reason: reason.into(),
        }
    }
}

pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&mut self, ctx: &StrategyContext<'_>) -> Decision;

    /// Similarity an offer must reach to satisfy a need in `round`.
    fn match_threshold(&self, _round: usize) -> f32 {
        DEFAULT_MATCH_THRESHOLD
    }

    /// Whether to send unsolicited offers to neighbors this round.
    fn should_initiate(&mut self, ctx: &StrategyContext<'_>) -> bool {
        !ctx.agent_needs.is_empty() && !ctx.agent_offers.is_empty()
    }

    /// The offer to open with toward a peer.
    fn propose(&mut self, ctx: &StrategyContext<'_>) -> Option<String> {
        choose_offer(ctx.agent_offers, ctx.peer_needs, ctx.round)
    }
}

/// Accept on match, counter with the best-fitting offer, reject when empty-handed.
fn matched_or_counter(ctx: &StrategyContext<'_>) -> Decision {
    if let Some(m) = ctx.best_match {
        return Decision::accept(format!("satisfies need '{}' ({:.2})", m.need, m.score));
    }
    match choose_offer(ctx.agent_offers, ctx.peer_needs, ctx.round) {
        Some(offer) => Decision::counter(Some(offer), "no matching need"),
        None => Decision::reject("no matching need and nothing to offer"),
    }
}

/// Accepts any match and keeps offering to neighbors with open needs, even
/// once its own needs are met.
#[derive(Clone, Debug, Default)]
pub struct Cooperative;

impl Strategy for Cooperative {
    fn name(&self) -> &'static str {
        "cooperative"
    }

    fn evaluate(&mut self, ctx: &StrategyContext<'_>) -> Decision {
        matched_or_counter(ctx)
    }

    fn should_initiate(&mut self, ctx: &StrategyContext<'_>) -> bool {
        !ctx.agent_offers.is_empty()
    }

    fn propose(&mut self, ctx: &StrategyContext<'_>) -> Option<String> {
        if ctx.agent_needs.is_empty() && ctx.peer_needs.is_empty() {
            return None;
        }
        choose_offer(ctx.agent_offers, ctx.peer_needs, ctx.round)
    }
}

/// Demands close matches early and concedes linearly per round.
#[derive(Clone, Debug)]
pub struct Competitive {
    pub opening: f32,
    pub concession: f32,
    pub floor: f32,
}

impl Default for Competitive {
    fn default() -> Self {
        Self {
            opening: 0.9,
            concession: 0.1,
            floor: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl Strategy for Competitive {
    fn name(&self) -> &'static str {
        "competitive"
    }

    fn match_threshold(&self, round: usize) -> f32 {
        (self.opening - self.concession * round as f32).max(self.floor)
    }

    fn evaluate(&mut self, ctx: &StrategyContext<'_>) -> Decision {
        matched_or_counter(ctx)
    }
}

/// Seeded coin-flip strategy.
pub struct Randomized {
    rng: StdRng,
    pub accept_probability: f64,
    pub counter_probability: f64,
}

impl Randomized {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            accept_probability: 0.7,
            counter_probability: 0.5,
        }
    }
}

impl Strategy for Randomized {
    fn name(&self) -> &'static str {
        "random"
    }

    fn evaluate(&mut self, ctx: &StrategyContext<'_>) -> Decision {
        if ctx.best_match.is_some() && self.rng.gen_bool(self.accept_probability) {
            return Decision::accept("coin flip accepted a match");
        }
        if !ctx.agent_offers.is_empty() && self.rng.gen_bool(self.counter_probability) {
            let pick = ctx.agent_offers[self.rng.gen_range(0..ctx.agent_offers.len())].clone();
            return Decision::counter(Some(pick), "coin flip countered");
        }
        Decision::reject("coin flip rejected")
    }
}

#[derive(Clone, Debug, Default)]
pub struct RejectAll;

impl Strategy for RejectAll {
    fn name(&self) -> &'static str {
        "reject"
    }

    fn evaluate(&mut self, _ctx: &StrategyContext<'_>) -> Decision {
        Decision::reject("rejects everything")
    }
}

/// Builds a strategy by name. `seed` only matters for `random`.
pub fn from_name(name: &str, seed: u64) -> Result<Box<dyn Strategy>> {
    match name.to_ascii_lowercase().as_str() {
        "cooperative" => Ok(Box::new(Cooperative)),
        "competitive" => Ok(Box::new(Competitive::default())),
        "random" => Ok(Box::new(Randomized::new(seed))),
        "reject" | "reject_all" => Ok(Box::new(RejectAll)),
        _ => Err(NegotiationError::UnknownStrategy(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn ctx<'a>(
        needs: &'a [String],
        offers: &'a [String],
        incoming: &'a str,
        best: Option<&'a NeedMatch>,
    ) -> StrategyContext<'a> {
        StrategyContext {
            agent_needs: needs,
            agent_offers: offers,
            incoming_offer: Some(incoming),
            round: 0,
            peer: None,
            peer_needs: &[],
            best_match: best,
            replying_to_counter: false,
        }
    }

    #[test]
    fn test_similarity_tiers() {
        assert_eq!(similarity("Web Design", "web design"), 1.0);
        assert_eq!(similarity("design", "web design"), 0.8);
        assert!((similarity("web design", "graphic design") - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(similarity("", "x"), 0.0);
    }

    #[test]
    fn test_best_match_prefers_highest_then_earliest() {
        let needs = strings(&["logo", "logo design", "tax"]);
        let m = best_need_match(&needs, "logo design", 0.5).unwrap();
        assert_eq!(m.index, 1);
        assert!(best_need_match(&needs, "plumbing", 0.5).is_none());
    }

    #[test]
    fn test_choose_offer_fits_peer_needs_or_rotates() {
        let offers = strings(&["tea", "coffee"]);
        assert_eq!(
            choose_offer(&offers, &strings(&["coffee"]), 0).as_deref(),
            Some("coffee")
        );
        assert_eq!(choose_offer(&offers, &[], 3).as_deref(), Some("coffee"));
        assert!(choose_offer(&[], &[], 0).is_none());
    }

    #[test]
    fn test_cooperative_accepts_match_counters_otherwise() {
        let needs = strings(&["tea"]);
        let offers = strings(&["coffee"]);
        let m = best_need_match(&needs, "tea", DEFAULT_MATCH_THRESHOLD).unwrap();
        let mut s = Cooperative;
        assert_eq!(s.evaluate(&ctx(&needs, &offers, "tea", Some(&m))).action, Action::Accept);

        let d = s.evaluate(&ctx(&needs, &offers, "milk", None));
        assert_eq!(d.action, Action::Counter);
        assert_eq!(d.counter_offer.as_deref(), Some("coffee"));

        assert_eq!(s.evaluate(&ctx(&needs, &[], "milk", None)).action, Action::Reject);
    }

    #[test]
    fn test_cooperative_keeps_offering_while_someone_needs_something() {
        let offers = strings(&["coffee"]);
        let peer_needs = strings(&["coffee"]);
        let mut s = Cooperative;
        let mut c = ctx(&[], &offers, "", None);
        c.incoming_offer = None;
        assert!(s.should_initiate(&c));
        assert_eq!(s.propose(&c), None);

        c.peer_needs = peer_needs.as_slice();
        assert_eq!(s.propose(&c).as_deref(), Some("coffee"));

        // the default initiation rule needs both sides
        assert!(!Competitive::default().should_initiate(&c));
    }

    #[test]
    fn test_competitive_concedes_to_floor() {
        let s = Competitive::default();
        assert!((s.match_threshold(0) - 0.9).abs() < 1e-6);
        assert!((s.match_threshold(2) - 0.7).abs() < 1e-6);
        assert_eq!(s.match_threshold(50), DEFAULT_MATCH_THRESHOLD);
    }

    #[test]
    fn test_randomized_is_reproducible() {
        let needs = strings(&["tea"]);
        let offers = strings(&["a", "b", "c"]);
        let run = |seed| {
            let mut s = Randomized::new(seed);
            (0..10)
                .map(|_| s.evaluate(&ctx(&needs, &offers, "milk", None)))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(9), run(9));
    }

    #[test]
    fn test_factory_knows_builtin_names() {
        for name in STRATEGY_NAMES {
            assert_eq!(from_name(name, 0).unwrap().name(), name);
        }
        assert!(matches!(
            from_name("psychic", 0),
            Err(NegotiationError::UnknownStrategy(_))
        ));
    }
}
