//! Candidate spellings for one instrument.
//!
//! The upstream accepts different spellings on different endpoints and does not document
//! which. Each endpoint gets a fixed, hand-ordered [`CandidatePolicy`]; cascades walk the
//! list front to back and the order must not be re-derived.

use std::fmt::{Display, Formatter};

const EXCHANGE_PREFIXES: [&str; 2] = ["NSE:", "BSE:"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exchange {
    Nse,
    Bse,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Nse => "NSE",
            Exchange::Bse => "BSE",
        }
    }
}

/// One entry of a policy table: a spelling template applied to the base symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spelling {
    /// `X`
    Bare,
    /// `X` followed by a suffix, e.g. `X-EQ`.
    Suffixed(&'static str),
    /// `EXCH:X`
    Prefixed(Exchange),
    /// `EXCH:X` followed by a suffix.
    PrefixedSuffixed(Exchange, &'static str),
}

impl Spelling {
    fn render(self, base: &str) -> Candidate {
        match self {
            Spelling::Bare => Candidate::new(None, base.to_string()),
            Spelling::Suffixed(suffix) => Candidate::new(None, format!("{base}{suffix}")),
            Spelling::Prefixed(exchange) => Candidate::new(Some(exchange), base.to_string()),
            Spelling::PrefixedSuffixed(exchange, suffix) => {
                Candidate::new(Some(exchange), format!("{base}{suffix}"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidatePolicy {
    pub name: &'static str,
    pub spellings: &'static [Spelling],
}

/// Single-symbol LTP quotes on the type A surface.
pub const QUOTE_TYPE_A: CandidatePolicy = CandidatePolicy {
    name: "quote-type-a",
    spellings: &[
        Spelling::PrefixedSuffixed(Exchange::Nse, "-EQ"),
        Spelling::Prefixed(Exchange::Nse),
        Spelling::Bare,
        Spelling::Suffixed("-EQ"),
    ],
};

/// Exchange-token quotes on the type B surface. The exchange becomes the payload key.
pub const QUOTE_TYPE_B: CandidatePolicy = CandidatePolicy {
    name: "quote-type-b",
    spellings: &[
        Spelling::Prefixed(Exchange::Nse),
        Spelling::PrefixedSuffixed(Exchange::Nse, "-EQ"),
        Spelling::Prefixed(Exchange::Bse),
    ],
};

/// Daily historical bars.
pub const HISTORY: CandidatePolicy = CandidatePolicy {
    name: "history",
    spellings: &[
        Spelling::Suffixed("-EQ"),
        Spelling::Suffixed("_EQ"),
        Spelling::Bare,
        Spelling::Suffixed(".NS"),
        Spelling::Suffixed(".NSE"),
        Spelling::Prefixed(Exchange::Nse),
        Spelling::Prefixed(Exchange::Bse),
    ],
};

/// A single spelling to try against an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub exchange: Option<Exchange>,
    /// Symbol text without the exchange prefix.
    pub token: String,
}

impl Candidate {
    fn new(exchange: Option<Exchange>, token: String) -> Self {
        Self { exchange, token }
    }
}

impl Display for Candidate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.exchange {
            Some(exchange) => write!(f, "{}:{}", exchange.as_str(), self.token),
            None => f.write_str(&self.token),
        }
    }
}

/// Strips a recognised exchange prefix (case-insensitive), trims and uppercases.
pub fn base_symbol(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = EXCHANGE_PREFIXES
        .iter()
        .find_map(|prefix| {
            trimmed
                .get(..prefix.len())
                .filter(|head| head.eq_ignore_ascii_case(prefix))
                .map(|_| &trimmed[prefix.len()..])
        })
        .unwrap_or(trimmed);

    stripped.trim().to_uppercase()
}

/// Expands `raw` through `policy`. Never empty; duplicates keep their first position.
pub fn candidates(raw: &str, policy: &CandidatePolicy) -> Vec<Candidate> {
    let base = base_symbol(raw);
    let mut out: Vec<Candidate> = Vec::with_capacity(policy.spellings.len());

    for spelling in policy.spellings {
        let candidate = spelling.render(&base);
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    }

    out
}
