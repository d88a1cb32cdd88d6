use axum::{Json, extract::Query, response::IntoResponse};
use regex::Regex;
use serde::{Deserialize, Serialize};

// Heuristic tolerances, in text-space units of the source document. Tuning
// these per document style is expected; they are the only knobs the
// clustering has.
pub const SAME_LINE_TOLERANCE: f64 = 3.0;
pub const LETTER_GAP_TOLERANCE: f64 = 0.5;

const CURRENCY_SYMBOLS: [char; 4] = ['$', '£', '€', '¥'];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFragment {
    #[serde(rename = "str", default)]
    pub text: String,
    // [a, b, c, d, x, y]; absent or truncated position data must compare
    // false everywhere downstream, so missing slots are NaN rather than zero.
    #[serde(default = "missing_transform", deserialize_with = "transform_or_nan")]
    pub transform: [f64; 6],
    #[serde(default = "missing_dimension")]
    pub width: f64,
    #[serde(rename = "fontName", default)]
    pub font_name: String,
}

fn missing_transform() -> [f64; 6] {
    [f64::NAN; 6]
}

// Short transform arrays leave their tail slots NaN instead of failing the
// whole request; extra elements are ignored.
fn transform_or_nan<'de, D>(deserializer: D) -> Result<[f64; 6], D::Error>
where
    D: serde::Deserializer<'de>,
{
    let values: Vec<f64> = Vec::deserialize(deserializer)?;
    let mut transform = missing_transform();
    for (slot, value) in transform.iter_mut().zip(values) {
        *slot = value;
    }
    Ok(transform)
}

fn missing_dimension() -> f64 {
    f64::NAN
}

#[derive(Debug, Clone)]
pub struct TextFragment {
    pub text: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    // First scale component of the transform: a font-size proxy, not a
    // measured glyph height.
    pub height: f64,
    pub font_name: String,
}

impl From<&RawFragment> for TextFragment {
    fn from(raw: &RawFragment) -> Self {
        Self {
            text: collapse_whitespace(&raw.text),
            x: raw.transform[4],
            y: raw.transform[5],
            width: raw.width,
            height: raw.transform[0],
            font_name: raw.font_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuItem {
    pub title: String,
    pub price: Option<f64>,
}

#[derive(Debug, Clone)]
struct PlacedFragment {
    fragment: TextFragment,
    // Whether the word-glue test held against the previous fragment when this
    // one was appended. Recorded once so merges never re-derive neighbours.
    glued: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Cluster {
    fragments: Vec<PlacedFragment>,
}

impl Cluster {
    pub fn append(&mut self, fragment: TextFragment) {
        let glued = self.in_middle_of_word(&fragment);
        self.fragments.push(PlacedFragment { fragment, glued });
    }

    pub fn merge(&mut self, other: Cluster) {
        self.fragments.extend(other.fragments);
    }

    pub fn has_fragments(&self) -> bool {
        !self.fragments.is_empty()
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    fn last(&self) -> Option<&TextFragment> {
        self.fragments.last().map(|placed| &placed.fragment)
    }

    pub fn is_same_cluster(&self, candidate: &TextFragment) -> bool {
        let joined = self.on_same_line(candidate)
            || self.in_middle_of_word(candidate)
            || self.continues_on_next_line(candidate);
        joined && !self.sentence_ended()
    }

    pub fn on_same_line(&self, candidate: &TextFragment) -> bool {
        match self.last() {
            Some(last) => (last.y - candidate.y).abs() < SAME_LINE_TOLERANCE,
            None => false,
        }
    }

    pub fn in_middle_of_word(&self, candidate: &TextFragment) -> bool {
        match self.last() {
            Some(last) => {
                self.on_same_line(candidate)
                    && (candidate.x - last.x - last.width).abs() < LETTER_GAP_TOLERANCE
            }
            None => false,
        }
    }

    // A wrapped second line only continues the cluster when the first line
    // already carries a price and the candidate keeps the same font and case
    // pattern. Vertically close but unrelated entries stay separate.
    fn continues_on_next_line(&self, candidate: &TextFragment) -> bool {
        let Some(last) = self.last() else {
            return false;
        };
        last.font_name == candidate.font_name
            && same_letter_case(&last.text, &candidate.text)
            && find_price(&self.title()).is_some()
            && candidate.y > last.y
            && candidate.y - last.y > candidate.height
    }

    fn sentence_ended(&self) -> bool {
        self.last().is_some_and(|last| last.text.ends_with('.'))
    }

    pub fn title(&self) -> String {
        let mut title = String::new();
        for placed in &self.fragments {
            if !placed.glued {
                title.push(' ');
            }
            title.push_str(&placed.fragment.text);
        }
        collapse_whitespace(&title)
            .replace(" , ", ", ")
            .trim()
            .to_string()
    }

    pub fn is_blank(&self) -> bool {
        if self.fragments.is_empty() {
            return true;
        }
        let cleaned = self.title().replace('~', "").replace(" ,", ",");
        start_case(collapse_whitespace(&cleaned).trim()).is_empty()
    }

    // A cluster whose whole rendered text reads as one number is a stranded
    // price column, typically rendered by the document as its own text run.
    pub fn contains_only_price(&self) -> bool {
        let title = self.title();
        if title == "." {
            return true;
        }
        if title.len() == 1 && title.starts_with(|c: char| c.is_ascii_digit()) {
            return true;
        }
        match (find_price(&title), lenient_float(&title)) {
            (Some(price), Some(value)) => price == value,
            _ => false,
        }
    }

    pub fn export(&self) -> MenuItem {
        let title = self.title();
        let price = find_price(&title);
        MenuItem { title, price }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseClass {
    Upper,
    Mixed,
    Other,
}

pub fn case_class(text: &str) -> CaseClass {
    if text == text.to_uppercase() {
        // Digit- and symbol-only runs land here too; they read as part of an
        // uppercase run for continuation purposes.
        CaseClass::Upper
    } else if text.chars().any(char::is_uppercase) {
        CaseClass::Mixed
    } else {
        CaseClass::Other
    }
}

fn same_letter_case(a: &str, b: &str) -> bool {
    (case_class(a) == CaseClass::Upper) == (case_class(b) == CaseClass::Upper)
}

pub fn find_price(text: &str) -> Option<f64> {
    let text = collapse_whitespace(text);
    let text = text.trim();
    if let Some(price) = first_monetary_match(text) {
        return Some(price);
    }
    fallback_price(text)
}

// Left-to-right scan for the first monetary mention: symbol-prefixed amount,
// symbol-suffixed amount, "for <amount>" promo phrasing, or the entire text
// being one bare amount.
fn first_monetary_match(text: &str) -> Option<f64> {
    let re = Regex::new(
        r"[$£€¥]\s*(\d+(?:[.,]\d+)?)|(\d+(?:[.,]\d+)?)\s*[$£€¥]|(?i:\bfor\b)\s+(\d+(?:[.,]\d+)?)|^(\d+(?:[.,]\d+)?)$",
    )
    .ok()?;

    let mut from = 0;
    loop {
        let caps = re.captures(&text[from..])?;
        let whole = caps.get(0)?;
        let end = from + whole.end();
        let next = text[end..].chars().next();

        // A trailing digit or slash means the number is part of a larger
        // token ("for 39/59" offers two values, not a price).
        if next.is_some_and(|c| c.is_ascii_digit() || c == '/') {
            from = end;
            continue;
        }

        let amount = if let Some(m) = caps.get(1) {
            if next.is_some_and(|c| CURRENCY_SYMBOLS.contains(&c)) {
                // Wedged between two currency mentions the fraction is
                // ambiguous: "£999.99€" reads as £999.
                m.as_str().split(['.', ',']).next()?
            } else {
                m.as_str()
            }
        } else if let Some(m) = caps.get(2).or_else(|| caps.get(3)).or_else(|| caps.get(4)) {
            m.as_str()
        } else {
            return None;
        };

        return amount.replace(',', ".").parse().ok();
    }
}

// No currency context anywhere: accept a bare number only when the unit
// pattern matched it with nothing attached. "600" passes; "600g", "6 oz",
// "15%" and "6PM" do not.
fn fallback_price(text: &str) -> Option<f64> {
    let number_re = Regex::new(r"(?:\d+(?:[.,]\d+)?)+").ok()?;
    let unit_re = Regex::new(
        r"[+-]?(?:\d+/|(?:\d+|^|\s)\.)?\d+\s*(?:[^\s\d+\-.,:;^/]+(?:/[^\s\d+\-.,:;^/]+)*)?",
    )
    .ok()?;

    let tagged: Vec<&str> = unit_re.find_iter(text).map(|m| m.as_str().trim()).collect();
    let candidates: Vec<&str> = number_re
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|number| tagged.contains(number))
        .collect();

    let first = *candidates.first()?;
    // Reject a lone 4-digit year. A year sitting next to other candidates is
    // not excluded; that matches the observed extraction behaviour.
    let year_re = Regex::new(r"^\d{4}$").ok()?;
    if candidates.len() == 1 && year_re.is_match(first) {
        return None;
    }
    parse_float_prefix(first)
}

// parseFloat-style: read the leading plain decimal and stop at anything else,
// so a comma ends the number here ("12,34" -> 12).
fn parse_float_prefix(raw: &str) -> Option<f64> {
    let re = Regex::new(r"^\d+(?:\.\d+)?").ok()?;
    re.find(raw)?.as_str().parse().ok()
}

// The title read as one float, tolerating a leading currency symbol so a
// stranded "£12.50" column still counts as price-only.
fn lenient_float(text: &str) -> Option<f64> {
    let stripped = text.trim_start().trim_start_matches(&CURRENCY_SYMBOLS[..]);
    parse_float_prefix(stripped.trim_start())
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_run = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !in_run {
                out.push(' ');
            }
            in_run = true;
        } else {
            out.push(c);
            in_run = false;
        }
    }
    out
}

fn start_case(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn cluster_fragments(fragments: &[RawFragment]) -> Vec<Cluster> {
    let mut clusters = Vec::new();
    let mut current = Cluster::default();

    for raw in fragments {
        let fragment = TextFragment::from(raw);
        if !current.is_same_cluster(&fragment) {
            clusters.push(std::mem::take(&mut current));
        }
        current.append(fragment);
    }

    // Seal the trailing cluster; on empty input there is nothing to seal.
    if !clusters.is_empty() {
        clusters.push(current);
    }

    clusters
}

fn merge_price_clusters(clusters: Vec<Cluster>) -> Vec<Cluster> {
    let mut merged: Vec<Cluster> = Vec::new();
    for cluster in clusters {
        match merged.last_mut() {
            Some(previous) if cluster.contains_only_price() => previous.merge(cluster),
            _ => merged.push(cluster),
        }
    }
    merged
}

pub fn extract_menu_items(fragments: &[RawFragment]) -> Vec<MenuItem> {
    let clusters = cluster_fragments(fragments);
    merge_price_clusters(clusters)
        .into_iter()
        .filter(|cluster| !cluster.is_blank())
        .map(|cluster| cluster.export())
        .collect()
}

// Pages arrive as separate fragment sequences; clustering runs over their
// concatenation in page order.
pub fn extract_menu_items_pages(pages: &[Vec<RawFragment>]) -> Vec<MenuItem> {
    let fragments: Vec<RawFragment> = pages.iter().flatten().cloned().collect();
    extract_menu_items(&fragments)
}

#[derive(Deserialize)]
pub struct ExtractParams {
    #[serde(default)]
    pub echo: bool,
}

#[derive(Deserialize)]
pub struct ExtractRequest {
    pub pages: Vec<Vec<RawFragment>>,
}

#[derive(Serialize)]
pub struct ExtractResponse {
    pub items: Vec<MenuItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragments: Option<Vec<RawFragment>>,
}

pub async fn extract_menu(
    Query(params): Query<ExtractParams>,
    Json(request): Json<ExtractRequest>,
) -> impl IntoResponse {
    let fragments: Vec<RawFragment> = request.pages.into_iter().flatten().collect();
    let items = extract_menu_items(&fragments);
    tracing::info!(
        fragments = fragments.len(),
        items = items.len(),
        "extracted menu items"
    );
    Json(ExtractResponse {
        items,
        // The raw echo exists for debugging and fixture generation.
        fragments: params.echo.then_some(fragments),
    })
}
