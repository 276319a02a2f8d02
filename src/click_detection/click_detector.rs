use log::{debug, trace};
use serde_json::{json, Value};

use crate::configuration::types::SlowClickOptions;
use crate::recording::types::{ms_to_secs, Breadcrumb};

use super::selector::{ClickTarget, SelectorList};

/// Tags that can meaningfully be judged as "did the click do something".
const SLOW_CLICK_TAGS: [&str; 3] = ["A", "BUTTON", "INPUT"];

/// Clicks on the same node closer together than this are coalesced.
const CLICK_DEDUPE_WINDOW_SECS: f64 = 1.0;

pub const SLOW_CLICK_CATEGORY: &str = "ui.slowClickDetected";
pub const MULTI_CLICK_CATEGORY: &str = "ui.multiClick";

/// A click waiting for its classification window to elapse.
#[derive(Debug, Clone)]
pub struct PendingClick {
    /// Seconds.
    pub timestamp: f64,
    pub node_id: u64,
    pub click_count: u32,
    /// Seconds between the click and the first mutation after it.
    pub mutation_after: Option<f64>,
    /// Seconds between the click and the first scroll after it.
    pub scroll_after: Option<f64>,
    breadcrumb: Breadcrumb,
}

/// Heuristic classifier for dead, slow and repeated clicks.
///
/// The detector is fed click breadcrumbs plus mutation/scroll/click
/// signals from the recording stream. Every pending click is resolved once
/// it is `timeout` old: if neither a mutation within `threshold` nor a
/// scroll within `scroll_timeout` followed it, a slow-click breadcrumb is
/// produced; independently, repeated clicks on the node produce a
/// multi-click breadcrumb.
#[derive(Debug)]
pub struct ClickDetector {
    clicks: Vec<PendingClick>,
    timeout: f64,
    threshold: f64,
    scroll_timeout: f64,
    ignore_selector: SelectorList,
}

impl ClickDetector {
    pub fn new(options: &SlowClickOptions) -> Self {
        Self {
            clicks: Vec::new(),
            timeout: options.timeout_ms as f64 / 1000.0,
            threshold: options.threshold_ms as f64 / 1000.0,
            scroll_timeout: options.scroll_timeout_ms as f64 / 1000.0,
            ignore_selector: SelectorList::parse(&options.ignore_selector),
        }
    }

    /// Starts tracking a click breadcrumb. Returns `false` when the click is
    /// ignored or coalesced into an already pending one.
    pub fn handle_click(&mut self, breadcrumb: Breadcrumb, target: &ClickTarget) -> bool {
        if breadcrumb.category() != Some("ui.click") || self.ignore_element(target) {
            trace!("Ignoring click on <{}>", target.tag_name);
            return false;
        }

        let timestamp = breadcrumb.timestamp;
        if self.clicks.iter().any(|click| {
            click.node_id == target.node_id
                && (click.timestamp - timestamp).abs() < CLICK_DEDUPE_WINDOW_SECS
        }) {
            trace!("Coalescing click on node {}", target.node_id);
            return false;
        }

        self.clicks.push(PendingClick {
            timestamp,
            node_id: target.node_id,
            click_count: 0,
            mutation_after: None,
            scroll_after: None,
            breadcrumb,
        });
        true
    }

    /// Records a DOM mutation observed at `timestamp_ms`.
    pub fn register_mutation(&mut self, timestamp_ms: i64) {
        let at = ms_to_secs(timestamp_ms);
        for click in self.clicks.iter_mut() {
            if click.mutation_after.is_none() && click.timestamp <= at {
                click.mutation_after = Some(at - click.timestamp);
            }
        }
    }

    /// Records a scroll observed at `timestamp_ms`.
    pub fn register_scroll(&mut self, timestamp_ms: i64) {
        let at = ms_to_secs(timestamp_ms);
        for click in self.clicks.iter_mut() {
            if click.scroll_after.is_none() && click.timestamp <= at {
                click.scroll_after = Some(at - click.timestamp);
            }
        }
    }

    /// Counts a raw click on `node_id` against every pending click on it.
    pub fn register_click(&mut self, node_id: u64) {
        for click in self.clicks.iter_mut().filter(|c| c.node_id == node_id) {
            click.click_count += 1;
        }
    }

    pub fn has_pending_clicks(&self) -> bool {
        !self.clicks.is_empty()
    }

    pub fn pending_clicks(&self) -> &[PendingClick] {
        &self.clicks
    }

    /// Resolves every click at least `timeout` old and returns the
    /// breadcrumbs they produce, in click order.
    pub fn check_clicks(&mut self, now_ms: i64, url: Option<&str>) -> Vec<Breadcrumb> {
        let now = ms_to_secs(now_ms);
        let timeout = self.timeout;
        let (resolved, pending): (Vec<PendingClick>, Vec<PendingClick>) = self
            .clicks
            .drain(..)
            .partition(|click| click.timestamp + timeout <= now);
        self.clicks = pending;

        resolved
            .into_iter()
            .flat_map(|click| self.generate_breadcrumbs(click, url))
            .collect()
    }

    pub fn clear(&mut self) {
        self.clicks.clear();
    }

    fn generate_breadcrumbs(&self, click: PendingClick, url: Option<&str>) -> Vec<Breadcrumb> {
        let mut out = Vec::new();
        let had_scroll = click
            .scroll_after
            .map(|after| after <= self.scroll_timeout)
            .unwrap_or(false);
        let had_mutation = click
            .mutation_after
            .map(|after| after <= self.threshold)
            .unwrap_or(false);

        if !had_scroll && !had_mutation {
            let time_after_click_ms =
                (click.mutation_after.unwrap_or(self.timeout).min(self.timeout) * 1000.0).round();
            let end_reason = if time_after_click_ms < self.timeout * 1000.0 {
                "mutation"
            } else {
                "timeout"
            };
            debug!(
                "Slow click on node {} ({}ms, {})",
                click.node_id, time_after_click_ms, end_reason
            );
            out.push(self.derive(
                &click,
                SLOW_CLICK_CATEGORY,
                url,
                &[
                    ("timeAfterClickMs", json!(time_after_click_ms)),
                    ("endReason", json!(end_reason)),
                    ("clickCount", json!(click.click_count.max(1))),
                ],
            ));
        }

        if click.click_count > 1 {
            debug!(
                "Multi click on node {} ({} clicks)",
                click.node_id, click.click_count
            );
            out.push(self.derive(
                &click,
                MULTI_CLICK_CATEGORY,
                url,
                &[
                    ("clickCount", json!(click.click_count)),
                    ("metric", json!(true)),
                ],
            ));
        }
        out
    }

    fn derive(
        &self,
        click: &PendingClick,
        category: &str,
        url: Option<&str>,
        extra: &[(&str, Value)],
    ) -> Breadcrumb {
        let mut breadcrumb = Breadcrumb::new(category, click.breadcrumb.timestamp);
        breadcrumb.message = click.breadcrumb.message.clone();
        breadcrumb.data = click.breadcrumb.data.clone();
        if let Some(url) = url {
            breadcrumb.data.insert("url".to_string(), json!(url));
        }
        for (key, value) in extra {
            breadcrumb.data.insert(key.to_string(), value.clone());
        }
        breadcrumb
    }

    fn ignore_element(&self, target: &ClickTarget) -> bool {
        let tag = target.tag();
        if !SLOW_CLICK_TAGS.contains(&tag.as_str()) {
            return true;
        }
        if tag == "INPUT" && !matches!(target.attribute("type"), Some("submit") | Some("button")) {
            return true;
        }
        if tag == "A"
            && (target.has_attribute("download")
                || target
                    .attribute("target")
                    .map(|t| t != "_self")
                    .unwrap_or(false))
        {
            return true;
        }
        !self.ignore_selector.is_empty() && self.ignore_selector.matches(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0_MS: i64 = 1_700_000_000_000;

    fn options() -> SlowClickOptions {
        SlowClickOptions {
            timeout_ms: 7_000,
            threshold_ms: 3_000,
            scroll_timeout_ms: 300,
            ignore_selector: ".ignore-me".to_string(),
        }
    }

    fn click_at(ms: i64) -> Breadcrumb {
        Breadcrumb::new("ui.click", ms_to_secs(ms)).with_message("body > button#save")
    }

    fn button(id: u64) -> ClickTarget {
        ClickTarget::new(id, "button")
    }

    #[test]
    fn mutation_within_threshold_is_a_normal_click() {
        let mut detector = ClickDetector::new(&options());
        assert!(detector.handle_click(click_at(T0_MS), &button(1)));
        detector.register_click(1);
        detector.register_mutation(T0_MS + 500);

        let crumbs = detector.check_clicks(T0_MS + 7_000, None);
        assert!(crumbs.is_empty());
        assert!(!detector.has_pending_clicks());
    }

    #[test]
    fn no_reaction_produces_timeout_slow_click() {
        let mut detector = ClickDetector::new(&options());
        detector.handle_click(click_at(T0_MS), &button(1));
        detector.register_click(1);

        assert!(detector.check_clicks(T0_MS + 6_999, None).is_empty());
        let crumbs = detector.check_clicks(T0_MS + 7_000, Some("https://example.com/a"));
        assert_eq!(crumbs.len(), 1);
        let crumb = &crumbs[0];
        assert_eq!(crumb.category(), Some(SLOW_CLICK_CATEGORY));
        assert_eq!(crumb.data["endReason"], "timeout");
        assert_eq!(crumb.data["timeAfterClickMs"], 7000.0);
        assert_eq!(crumb.data["clickCount"], 1);
        assert_eq!(crumb.data["url"], "https://example.com/a");
        assert_eq!(crumb.message.as_deref(), Some("body > button#save"));
    }

    #[test]
    fn late_mutation_ends_slow_click_with_mutation_reason() {
        let mut detector = ClickDetector::new(&options());
        detector.handle_click(click_at(T0_MS), &button(1));
        detector.register_mutation(T0_MS + 4_000);

        let crumbs = detector.check_clicks(T0_MS + 7_000, None);
        assert_eq!(crumbs.len(), 1);
        assert_eq!(crumbs[0].data["endReason"], "mutation");
        assert_eq!(crumbs[0].data["timeAfterClickMs"], 4000.0);
    }

    #[test]
    fn quick_scroll_counts_as_reaction() {
        let mut detector = ClickDetector::new(&options());
        detector.handle_click(click_at(T0_MS), &button(1));
        detector.register_scroll(T0_MS + 200);
        assert!(detector.check_clicks(T0_MS + 7_000, None).is_empty());
    }

    #[test]
    fn mutation_before_click_is_not_a_reaction() {
        let mut detector = ClickDetector::new(&options());
        detector.register_mutation(T0_MS - 10);
        detector.handle_click(click_at(T0_MS), &button(1));
        detector.register_mutation(T0_MS - 5);
        let crumbs = detector.check_clicks(T0_MS + 7_000, None);
        assert_eq!(crumbs.len(), 1);
        assert_eq!(crumbs[0].data["endReason"], "timeout");
    }

    #[test]
    fn three_clicks_produce_one_multi_click() {
        let mut detector = ClickDetector::new(&options());
        assert!(detector.handle_click(click_at(T0_MS), &button(1)));
        detector.register_click(1);
        assert!(!detector.handle_click(click_at(T0_MS + 200), &button(1)));
        detector.register_click(1);
        assert!(!detector.handle_click(click_at(T0_MS + 400), &button(1)));
        detector.register_click(1);
        detector.register_mutation(T0_MS + 100);

        let crumbs = detector.check_clicks(T0_MS + 7_000, None);
        let multi: Vec<_> = crumbs
            .iter()
            .filter(|c| c.category() == Some(MULTI_CLICK_CATEGORY))
            .collect();
        assert_eq!(multi.len(), 1);
        assert_eq!(multi[0].data["clickCount"], 3);
        assert!(crumbs
            .iter()
            .all(|c| c.category() != Some(SLOW_CLICK_CATEGORY)));
    }

    #[test]
    fn multi_click_is_reported_alongside_slow_click() {
        let mut detector = ClickDetector::new(&options());
        detector.handle_click(click_at(T0_MS), &button(1));
        detector.register_click(1);
        detector.register_click(1);

        let crumbs = detector.check_clicks(T0_MS + 7_000, None);
        let categories: Vec<_> = crumbs.iter().filter_map(|c| c.category()).collect();
        assert_eq!(categories, vec![SLOW_CLICK_CATEGORY, MULTI_CLICK_CATEGORY]);
        assert_eq!(crumbs[0].data["clickCount"], 2);
    }

    #[test]
    fn non_interactive_and_new_context_targets_are_ignored() {
        let mut detector = ClickDetector::new(&options());
        assert!(!detector.handle_click(click_at(T0_MS), &ClickTarget::new(1, "div")));
        assert!(!detector.handle_click(
            click_at(T0_MS),
            &ClickTarget::new(2, "input").with_attribute("type", "text")
        ));
        assert!(detector.handle_click(
            click_at(T0_MS),
            &ClickTarget::new(3, "input").with_attribute("type", "submit")
        ));
        assert!(!detector.handle_click(
            click_at(T0_MS),
            &ClickTarget::new(4, "a").with_attribute("target", "_blank")
        ));
        assert!(!detector.handle_click(
            click_at(T0_MS),
            &ClickTarget::new(5, "a").with_attribute("download", "")
        ));
        assert!(detector.handle_click(
            click_at(T0_MS),
            &ClickTarget::new(6, "a").with_attribute("target", "_self")
        ));
        assert!(!detector.handle_click(
            click_at(T0_MS),
            &ClickTarget::new(7, "button").with_attribute("class", "ignore-me")
        ));
    }

    #[test]
    fn only_click_breadcrumbs_are_tracked() {
        let mut detector = ClickDetector::new(&options());
        let input = Breadcrumb::new("ui.input", ms_to_secs(T0_MS));
        assert!(!detector.handle_click(input, &button(1)));
    }

    #[test]
    fn distinct_clicks_a_second_apart_are_tracked_separately() {
        let mut detector = ClickDetector::new(&options());
        assert!(detector.handle_click(click_at(T0_MS), &button(1)));
        assert!(detector.handle_click(click_at(T0_MS + 1_500), &button(1)));
        assert_eq!(detector.pending_clicks().len(), 2);

        let first = detector.check_clicks(T0_MS + 7_000, None);
        assert_eq!(first.len(), 1);
        assert!(detector.has_pending_clicks());
        let second = detector.check_clicks(T0_MS + 8_500, None);
        assert_eq!(second.len(), 1);
        assert!(!detector.has_pending_clicks());
    }
}
