// Header template expansion
//
// A template is literal text with `{{ ... }}` actions. An action is either a
// field of the build context (`{{.CallId}}`) or a call to one of a fixed set
// of helpers (`{{RandStr 8}}`, `{{Upper .Method}}`).

use nom::{
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{all_consuming, map, map_res, opt, recognize},
    multi::many0,
    sequence::{delimited, pair, preceded},
    IResult,
};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::transport::MAX_MESSAGE_SIZE;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("unknown function {0}")]
    UnknownFunction(String),
    #[error("unknown field .{0}")]
    UnknownField(String),
    #[error("{name} expects {expected} argument(s), got {got}")]
    Arity {
        name: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("argument of {name} must be {expected}: {got}")]
    ArgType {
        name: &'static str,
        expected: &'static str,
        got: String,
    },
}

/// Random alphanumeric string, used for Call-IDs, tags and `RandStr`.
pub fn rand_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn rand_digits(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// The helper functions available inside actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    RandStr,
    RandDigits,
    Upper,
    Lower,
}

impl Builtin {
    pub fn lookup(name: &str) -> Option<Builtin> {
        match name {
            "RandStr" => Some(Builtin::RandStr),
            "RandDigits" => Some(Builtin::RandDigits),
            "Upper" => Some(Builtin::Upper),
            "Lower" => Some(Builtin::Lower),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::RandStr => "RandStr",
            Builtin::RandDigits => "RandDigits",
            Builtin::Upper => "Upper",
            Builtin::Lower => "Lower",
        }
    }

    fn arity(&self) -> usize {
        1
    }

    fn apply(&self, args: &[String]) -> Result<String, TemplateError> {
        let arg = &args[0];
        match self {
            Builtin::RandStr | Builtin::RandDigits => {
                // 1 メッセージに収まらない長さは受け付けない
                let len: usize = arg
                    .trim()
                    .parse()
                    .ok()
                    .filter(|n| *n <= MAX_MESSAGE_SIZE)
                    .ok_or_else(|| TemplateError::ArgType {
                        name: self.name(),
                        expected: "a length up to 65535",
                        got: arg.clone(),
                    })?;
                Ok(if *self == Builtin::RandStr {
                    rand_string(len)
                } else {
                    rand_digits(len)
                })
            }
            Builtin::Upper => Ok(arg.to_uppercase()),
            Builtin::Lower => Ok(arg.to_lowercase()),
        }
    }
}

/// Values visible to a template as `.Name`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateContext {
    pub call_id: String,
    pub seq: u32,
    pub method: String,
    pub local_tag: String,
    pub remote_tag: String,
    pub transport: String,
    pub local_addr: String,
    pub local_host: String,
    pub remote_addr: String,
    pub remote_host: String,
    pub from_number: String,
    pub from_noa: String,
    pub to_number: String,
    pub to_noa: String,
    pub branch: String,
    pub tags: String,
}

impl TemplateContext {
    pub const FIELDS: &'static [&'static str] = &[
        "CallId",
        "Seq",
        "Method",
        "LocalTag",
        "RemoteTag",
        "ToTagParam",
        "Transport",
        "LocalAddr",
        "LocalHost",
        "RemoteAddr",
        "RemoteHost",
        "FromNumber",
        "FromNoa",
        "ToNumber",
        "ToNoa",
        "Branch",
        "Tags",
    ];

    pub fn field(&self, name: &str) -> Option<String> {
        let v = match name {
            "CallId" => self.call_id.clone(),
            "Seq" => self.seq.to_string(),
            "Method" => self.method.clone(),
            "LocalTag" => self.local_tag.clone(),
            "RemoteTag" => self.remote_tag.clone(),
            "ToTagParam" => {
                if self.remote_tag.is_empty() {
                    String::new()
                } else {
                    format!(";tag={}", self.remote_tag)
                }
            }
            "Transport" => self.transport.clone(),
            "LocalAddr" => self.local_addr.clone(),
            "LocalHost" => self.local_host.clone(),
            "RemoteAddr" => self.remote_addr.clone(),
            "RemoteHost" => self.remote_host.clone(),
            "FromNumber" => self.from_number.clone(),
            "FromNoa" => self.from_noa.clone(),
            "ToNumber" => self.to_number.clone(),
            "ToNoa" => self.to_noa.clone(),
            "Branch" => self.branch.clone(),
            "Tags" => self.tags.clone(),
            _ => return None,
        };
        Some(v)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Arg {
    Field(String),
    Str(String),
    Int(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Field(String),
    Call { func: Builtin, args: Vec<Arg> },
}

/// A parsed template, checked against the builtin registry and the field list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

fn ident(i: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(i)
}

fn field_ref(i: &str) -> IResult<&str, Arg> {
    map(preceded(char('.'), ident), |s: &str| Arg::Field(s.to_string()))(i)
}

fn string_lit(i: &str) -> IResult<&str, Arg> {
    map(
        delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
        |s: &str| Arg::Str(s.to_string()),
    )(i)
}

fn int_lit(i: &str) -> IResult<&str, Arg> {
    map_res(recognize(pair(opt(char('-')), digit1)), |s: &str| {
        s.parse::<i64>().map(Arg::Int)
    })(i)
}

fn arg(i: &str) -> IResult<&str, Arg> {
    alt((field_ref, string_lit, int_lit))(i)
}

enum Action<'a> {
    Field(String),
    Call(&'a str, Vec<Arg>),
}

fn action(i: &str) -> IResult<&str, Action<'_>> {
    let call = map(pair(ident, many0(preceded(multispace1, arg))), |(name, args)| {
        Action::Call(name, args)
    });
    let field = map(preceded(char('.'), ident), |s: &str| Action::Field(s.to_string()));
    all_consuming(delimited(multispace0, alt((field, call)), multispace0))(i)
}

fn check_field(name: &str) -> Result<(), TemplateError> {
    if TemplateContext::FIELDS.contains(&name) {
        Ok(())
    } else {
        Err(TemplateError::UnknownField(name.to_string()))
    }
}

impl Template {
    pub fn parse(source: &str) -> Result<Template, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Text(rest[..open].to_string()));
            }
            let inner_start = open + 2;
            let close = rest[inner_start..]
                .find("}}")
                .ok_or_else(|| TemplateError::Syntax {
                    offset: offset + open,
                    message: "unclosed action".to_string(),
                })?;
            let inner = &rest[inner_start..inner_start + close];
            let (_, parsed) = action(inner).map_err(|_| TemplateError::Syntax {
                offset: offset + inner_start,
                message: format!("malformed action: {{{{{}}}}}", inner),
            })?;
            segments.push(match parsed {
                Action::Field(name) => {
                    check_field(&name)?;
                    Segment::Field(name)
                }
                Action::Call(name, args) => {
                    let func = Builtin::lookup(name)
                        .ok_or_else(|| TemplateError::UnknownFunction(name.to_string()))?;
                    if args.len() != func.arity() {
                        return Err(TemplateError::Arity {
                            name: func.name(),
                            expected: func.arity(),
                            got: args.len(),
                        });
                    }
                    for a in &args {
                        if let Arg::Field(f) = a {
                            check_field(f)?;
                        }
                    }
                    Segment::Call { func, args }
                }
            });
            let consumed = inner_start + close + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }
        Ok(Template {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, ctx: &TemplateContext) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len() + 32);
        for seg in &self.segments {
            match seg {
                Segment::Text(t) => out.push_str(t),
                Segment::Field(name) => out.push_str(&resolve(ctx, name)?),
                Segment::Call { func, args } => {
                    let values = args
                        .iter()
                        .map(|a| match a {
                            Arg::Field(name) => resolve(ctx, name),
                            Arg::Str(s) => Ok(s.clone()),
                            Arg::Int(n) => Ok(n.to_string()),
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    out.push_str(&func.apply(&values)?);
                }
            }
        }
        Ok(out)
    }
}

fn resolve(ctx: &TemplateContext, name: &str) -> Result<String, TemplateError> {
    ctx.field(name)
        .ok_or_else(|| TemplateError::UnknownField(name.to_string()))
}

/// Parse and render in one go.
pub fn render(source: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
    Template::parse(source)?.render(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TemplateContext {
        TemplateContext {
            call_id: "abc".into(),
            seq: 3,
            method: "invite".into(),
            local_tag: "lt".into(),
            remote_addr: "10.0.0.1:5060".into(),
            to_number: "2000".into(),
            ..TemplateContext::default()
        }
    }

    #[test]
    fn test_plain_text_passes_through() {
        assert_eq!(render("X-Test: 1", &ctx()).unwrap(), "X-Test: 1");
        assert_eq!(render("", &ctx()).unwrap(), "");
    }

    #[test]
    fn test_field_substitution() {
        let out = render("To: <sip:{{.ToNumber}}@{{ .RemoteAddr }}>{{.ToTagParam}}", &ctx()).unwrap();
        assert_eq!(out, "To: <sip:2000@10.0.0.1:5060>");
        let mut c = ctx();
        c.remote_tag = "rt".into();
        let out = render("{{.ToTagParam}}/{{.Seq}}", &c).unwrap();
        assert_eq!(out, ";tag=rt/3");
    }

    #[test]
    fn test_builtin_calls() {
        let out = render("{{RandStr 12}}", &ctx()).unwrap();
        assert_eq!(out.len(), 12);
        assert!(out.chars().all(|c| c.is_ascii_alphanumeric()));

        let out = render("{{RandDigits 6}}", &ctx()).unwrap();
        assert_eq!(out.len(), 6);
        assert!(out.chars().all(|c| c.is_ascii_digit()));

        assert_eq!(render("{{Upper .Method}}", &ctx()).unwrap(), "INVITE");
        assert_eq!(render("{{Lower \"ABC\"}}", &ctx()).unwrap(), "abc");
    }

    #[test]
    fn test_unknown_function_is_rejected_at_parse() {
        let err = Template::parse("{{Exec \"rm\"}}").unwrap_err();
        assert_eq!(err, TemplateError::UnknownFunction("Exec".into()));
    }

    #[test]
    fn test_unknown_field_is_rejected_at_parse() {
        let err = Template::parse("{{.Nope}}").unwrap_err();
        assert_eq!(err, TemplateError::UnknownField("Nope".into()));
        let err = Template::parse("{{Upper .Nope}}").unwrap_err();
        assert_eq!(err, TemplateError::UnknownField("Nope".into()));
    }

    #[test]
    fn test_arity_and_syntax_errors() {
        assert!(matches!(
            Template::parse("{{RandStr}}").unwrap_err(),
            TemplateError::Arity { expected: 1, got: 0, .. }
        ));
        assert!(matches!(
            Template::parse("X: {{.CallId").unwrap_err(),
            TemplateError::Syntax { offset: 3, .. }
        ));
        assert!(matches!(
            Template::parse("{{ ! }}").unwrap_err(),
            TemplateError::Syntax { .. }
        ));
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let t = Template::parse("{{RandDigits 9223372036854775807}}").unwrap();
        assert!(matches!(
            t.render(&ctx()).unwrap_err(),
            TemplateError::ArgType { name: "RandDigits", .. }
        ));
        let t = Template::parse("{{RandStr 65536}}").unwrap();
        assert!(t.render(&ctx()).is_err());
        let t = Template::parse("{{RandStr 65535}}").unwrap();
        assert_eq!(t.render(&ctx()).unwrap().len(), 65535);
    }

    #[test]
    fn test_bad_length_argument_fails_at_render() {
        let t = Template::parse("{{RandStr .Method}}").unwrap();
        assert!(matches!(
            t.render(&ctx()).unwrap_err(),
            TemplateError::ArgType { name: "RandStr", .. }
        ));
    }

    #[test]
    fn test_every_listed_field_resolves() {
        let c = ctx();
        for f in TemplateContext::FIELDS {
            assert!(c.field(f).is_some(), "field {} should resolve", f);
        }
    }

    #[test]
    fn test_rand_string_length() {
        assert_eq!(rand_string(10).len(), 10);
        assert_ne!(rand_string(16), rand_string(16));
    }
}
