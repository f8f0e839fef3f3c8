//! VSN descriptors
//!
//! An archive set names the volumes it may use through a list of
//! descriptors: a single regular expression, a named pool of expressions,
//! or "any".

use regex::Regex;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct VsnPool {
    pub name: String,
    pub exprs: Vec<Regex>,
}

impl VsnPool {
    pub fn new(name: &str, exprs: &[String]) -> std::result::Result<Self, String> {
        let exprs = exprs
            .iter()
            .map(|e| compile(e))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            name: name.to_string(),
            exprs,
        })
    }
}

#[derive(Debug, Clone)]
pub enum VsnDesc {
    /// Matches every VSN.
    Any,
    Exp(Regex),
    Pool(Arc<VsnPool>),
}

impl VsnDesc {
    /// Parse one `vsns` entry. `any` and `.*` both mean any VSN.
    pub fn parse(expr: &str) -> std::result::Result<Self, String> {
        match expr.trim() {
            "any" | ".*" => Ok(VsnDesc::Any),
            e => compile(e).map(VsnDesc::Exp),
        }
    }

    pub fn matches(&self, vsn: &str) -> bool {
        match self {
            VsnDesc::Any => true,
            VsnDesc::Exp(re) => re.is_match(vsn),
            VsnDesc::Pool(pool) => pool.exprs.iter().any(|re| re.is_match(vsn)),
        }
    }

    /// Expressions in the order a volume search steps through them.
    /// `None` stands for the match-anything expression.
    pub fn expressions(&self) -> Vec<Option<&Regex>> {
        match self {
            VsnDesc::Any => vec![None],
            VsnDesc::Exp(re) => vec![Some(re)],
            VsnDesc::Pool(pool) => pool.exprs.iter().map(Some).collect(),
        }
    }
}

impl std::fmt::Display for VsnDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VsnDesc::Any => write!(f, ".*"),
            VsnDesc::Exp(re) => write!(f, "{}", re.as_str()),
            VsnDesc::Pool(pool) => write!(f, "-pool {}", pool.name),
        }
    }
}

/// True if any descriptor in the list accepts `vsn`.
pub fn matches_any(descs: &[VsnDesc], vsn: &str) -> bool {
    descs.iter().any(|d| d.matches(vsn))
}

fn compile(expr: &str) -> std::result::Result<Regex, String> {
    Regex::new(expr).map_err(|e| format!("invalid VSN expression '{}': {}", expr, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_matching() {
        let any = VsnDesc::parse("any").unwrap();
        assert!(any.matches("VOL001"));
        assert!(matches!(VsnDesc::parse(".*").unwrap(), VsnDesc::Any));

        let exp = VsnDesc::parse("^VOL0[0-4]").unwrap();
        assert!(exp.matches("VOL003"));
        assert!(!exp.matches("VOL050"));

        let pool = Arc::new(VsnPool::new("p", &["^A".into(), "^B".into()]).unwrap());
        let desc = VsnDesc::Pool(pool);
        assert!(desc.matches("B12"));
        assert!(!desc.matches("C12"));
        assert_eq!(desc.expressions().len(), 2);
    }

    #[test]
    fn test_invalid_expression() {
        assert!(VsnDesc::parse("VOL[").is_err());
        assert!(VsnPool::new("bad", &["(".into()]).is_err());
    }
}
