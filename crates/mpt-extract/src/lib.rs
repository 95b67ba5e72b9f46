//! Price extraction from stored menu pages.
//!
//! A page is parsed into a node tree, the menu section is located by element id, the
//! first text node inside it matching the item name is found, and the price is taken
//! from the text that follows it in document order. The last step is delegated to a
//! [`PriceLocator`] so the proximity heuristic can be replaced without touching callers.

use std::sync::LazyLock;

use mpt_core::{Price, DEFAULT_CURRENCY_SYMBOL};
use regex::Regex;
use scraper::{ElementRef, Html};
use thiserror::Error;

pub const CRATE_NAME: &str = "mpt-extract";

/// Element id of the menu section on delivery-platform pages.
pub const DEFAULT_SECTION_ID: &str = "tylihta";

/// Why no price was extracted. These are expected outcomes, not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NotFound {
    #[error("item name is empty or cannot be matched")]
    InvalidItemName,
    #[error("menu section is missing")]
    SectionMissing,
    #[error("item name not present in menu section")]
    NameNotMatched,
    #[error("no price follows the item name")]
    NoPriceAfterName,
}

/// Case-insensitive item-name matcher where any whitespace run in the name matches any
/// whitespace run in the document, including none at all.
#[derive(Debug, Clone)]
pub struct NameMatcher {
    regex: Regex,
}

impl NameMatcher {
    pub fn new(item_name: &str) -> Option<Self> {
        let words: Vec<String> = item_name.split_whitespace().map(regex::escape).collect();
        if words.is_empty() {
            return None;
        }
        let regex = Regex::new(&format!(r"(?i){}", words.join(r"\s*"))).ok()?;
        Some(Self { regex })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Accepts `€ 3,50` / `€3.5` and `3,50 €` / `3.50€`: a numeral with up to two decimals and
/// either separator, with the currency symbol on one side.
#[derive(Debug, Clone)]
pub struct PriceTokenPattern {
    regex: Regex,
}

impl PriceTokenPattern {
    pub fn new(currency_symbol: &str) -> Result<Self, regex::Error> {
        let symbol = regex::escape(currency_symbol);
        let numeral = r"([0-9]+(?:[.,][0-9]{1,2})?)";
        let regex = Regex::new(&format!(r"{symbol}\s*{numeral}|{numeral}\s*{symbol}"))?;
        Ok(Self { regex })
    }

    /// First price token in `text`, with the matched surface form.
    pub fn find<'t>(&self, text: &'t str) -> Option<(Price, &'t str)> {
        self.regex.captures_iter(text).find_map(|caps| {
            let numeral = caps.get(1).or_else(|| caps.get(2))?;
            let price = Price::parse_numeral(numeral.as_str())?;
            Some((price, caps.get(0)?.as_str()))
        })
    }
}

/// A text node of the parsed document, in document order.
#[derive(Debug, Clone, Copy)]
pub struct TextNode<'a> {
    pub text: &'a str,
    pub parent: Option<ElementRef<'a>>,
    pub in_section: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedPrice {
    pub price: Price,
    pub token: String,
}

/// Strategy that associates an item-name match with a price.
pub trait PriceLocator: Send + Sync {
    fn name(&self) -> &'static str;

    /// `following` holds every text node after `matched`, to the end of the document.
    fn locate(
        &self,
        matched: &TextNode<'_>,
        following: &[TextNode<'_>],
        prices: &PriceTokenPattern,
    ) -> Option<LocatedPrice>;
}

/// The first price token after the name match in document order wins, regardless of
/// DOM nesting.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestFollowingPrice;

impl PriceLocator for NearestFollowingPrice {
    fn name(&self) -> &'static str {
        "nearest-following"
    }

    fn locate(
        &self,
        _matched: &TextNode<'_>,
        following: &[TextNode<'_>],
        prices: &PriceTokenPattern,
    ) -> Option<LocatedPrice> {
        following.iter().find_map(|node| {
            prices.find(node.text).map(|(price, token)| LocatedPrice {
                price,
                token: token.to_string(),
            })
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub section_id: String,
    pub currency_symbol: String,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            section_id: DEFAULT_SECTION_ID.to_string(),
            currency_symbol: DEFAULT_CURRENCY_SYMBOL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub price: Price,
    pub matched_text: String,
    pub token: String,
}

pub struct PriceExtractor {
    section_id: String,
    prices: PriceTokenPattern,
    locator: Box<dyn PriceLocator>,
}

impl std::fmt::Debug for PriceExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceExtractor")
            .field("section_id", &self.section_id)
            .field("locator", &self.locator.name())
            .finish()
    }
}

impl PriceExtractor {
    pub fn new(config: ExtractorConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            section_id: config.section_id,
            prices: PriceTokenPattern::new(&config.currency_symbol)?,
            locator: Box::new(NearestFollowingPrice),
        })
    }

    pub fn with_locator(mut self, locator: Box<dyn PriceLocator>) -> Self {
        self.locator = locator;
        self
    }

    pub fn extract_price(&self, html: &str, item_name: &str) -> Result<Price, NotFound> {
        self.extract(html, item_name).map(|e| e.price)
    }

    pub fn extract(&self, html: &str, item_name: &str) -> Result<Extraction, NotFound> {
        let matcher = NameMatcher::new(item_name).ok_or(NotFound::InvalidItemName)?;
        let document = Html::parse_document(html);
        let root = document.tree.root();

        let section = root
            .descendants()
            .find(|node| {
                node.value()
                    .as_element()
                    .and_then(|el| el.id())
                    .is_some_and(|id| id == self.section_id)
            })
            .ok_or(NotFound::SectionMissing)?;

        let texts: Vec<TextNode<'_>> = root
            .descendants()
            .filter_map(|node| {
                let text = node.value().as_text()?;
                Some(TextNode {
                    text: &**text,
                    parent: node.parent().and_then(ElementRef::wrap),
                    in_section: node.ancestors().any(|a| a == section),
                })
            })
            .collect();

        let name_index = texts
            .iter()
            .position(|node| node.in_section && matcher.is_match(node.text))
            .ok_or(NotFound::NameNotMatched)?;

        let matched = &texts[name_index];
        let located = self
            .locator
            .locate(matched, &texts[name_index + 1..], &self.prices)
            .ok_or(NotFound::NoPriceAfterName)?;

        tracing::trace!(
            locator = self.locator.name(),
            price = %located.price,
            token = located.token.as_str(),
            "price located"
        );
        Ok(Extraction {
            price: located.price,
            matched_text: matched.text.trim().to_string(),
            token: located.token,
        })
    }
}

static DEFAULT_EXTRACTOR: LazyLock<PriceExtractor> =
    LazyLock::new(|| PriceExtractor::new(ExtractorConfig::default()).expect("valid price pattern"));

/// Extracts `item_name`'s price using the default section id and currency symbol.
pub fn extract_price(html: &str, item_name: &str) -> Result<Price, NotFound> {
    DEFAULT_EXTRACTOR.extract_price(html, item_name)
}
