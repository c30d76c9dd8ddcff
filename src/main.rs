use std::process;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bpe_regex::{EndMode, PatternBuilder, Token, TokenId, tokenizer};

#[derive(Debug, Parser)]
#[command(name = "bpere", about = "Match token-level patterns against BPE-encoded text")]
struct Cli {
    /// Trace every operation evaluation
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Match a pattern against one or more inputs
    Match {
        /// Tokenizer profile
        #[arg(short, long, default_value = "cl100k_base")]
        tokenizer: String,
        /// Require the input to end where the pattern ends
        #[arg(long)]
        strict: bool,
        /// Pattern operation, in order: one=<t>, set=<t>|<t>, plus=<t>,
        /// star=<t>, opt=<t> or any.  `#<n>` is the raw token id n; write
        /// `\#`, `\|` and `\\` for a literal `#`, `|` or `\`.
        #[arg(short = 'p', long = "op", required = true)]
        ops: Vec<OpArg>,
        #[arg(required = true)]
        inputs: Vec<String>,
    },
    /// Print the token ids of each text
    Tokens {
        /// Tokenizer profile
        #[arg(short, long, default_value = "cl100k_base")]
        tokenizer: String,
        #[arg(required = true)]
        texts: Vec<String>,
    },
}

#[derive(Clone, Debug)]
enum OpArg {
    One(Token),
    Set(Vec<Token>),
    Plus(Token),
    Star(Token),
    Opt(Token),
    Any,
}

impl FromStr for OpArg {
    type Err = String;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        if arg == "any" {
            return Ok(OpArg::Any);
        }
        let (kind, value) = arg
            .split_once('=')
            .ok_or_else(|| format!("expected `<kind>=<token>` or `any`, got `{arg}`"))?;
        match kind {
            "one" => parse_token(value).map(OpArg::One),
            "set" => split_members(value)
                .into_iter()
                .map(parse_token)
                .collect::<Result<Vec<_>, _>>()
                .map(OpArg::Set),
            "plus" => parse_token(value).map(OpArg::Plus),
            "star" => parse_token(value).map(OpArg::Star),
            "opt" => parse_token(value).map(OpArg::Opt),
            other => Err(format!("unknown operation `{other}`")),
        }
    }
}

/// Split a `set=` value on every `|` that is not escaped.
fn split_members(value: &str) -> Vec<&str> {
    let mut members = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '|' => {
                members.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    members.push(&value[start..]);
    members
}

fn parse_token(value: &str) -> Result<Token, String> {
    match value.strip_prefix('#') {
        Some(id) => id
            .parse::<TokenId>()
            .map(Token::Id)
            .map_err(|err| format!("invalid token id `{id}`: {err}")),
        None => unescape(value).map(Token::from),
    }
}

fn unescape(value: &str) -> Result<String, String> {
    let mut text = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            text.push(c);
            continue;
        }
        match chars.next() {
            Some(escaped @ ('#' | '|' | '\\')) => text.push(escaped),
            Some(other) => return Err(format!("unknown escape `\\{other}` in `{value}`")),
            None => return Err(format!("dangling `\\` at the end of `{value}`")),
        }
    }
    Ok(text)
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("bpe_regex=trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_match(tokenizer: &str, strict: bool, ops: Vec<OpArg>, inputs: &[String]) {
    let end_mode = if strict {
        EndMode::Strict
    } else {
        EndMode::Prefix
    };
    let builder = ops
        .into_iter()
        .fold(PatternBuilder::new(), |builder, op| match op {
            OpArg::One(token) => builder.one(token),
            OpArg::Set(tokens) => builder.set(tokens),
            OpArg::Plus(token) => builder.one_or_more(token),
            OpArg::Star(token) => builder.zero_or_more(token),
            OpArg::Opt(token) => builder.optional(token),
            OpArg::Any => builder.any(),
        })
        .end_mode(end_mode);
    let pattern = builder.build(tokenizer).unwrap_or_else(|e| {
        eprintln!("error: failed to build pattern: {e}");
        process::exit(1);
    });

    eprintln!("pattern: {pattern}");
    eprintln!("tokenizer: {}", pattern.tokenizer().name());
    eprintln!("end mode: {:?}", pattern.end_mode());
    eprintln!();

    let mut any_failed = false;
    for input in inputs {
        if pattern.matches(input) {
            println!("  \x1b[32mMATCH\x1b[0m  {:?}", input);
        } else {
            println!("  \x1b[31mNO MATCH\x1b[0m  {:?}", input);
            any_failed = true;
        }
    }

    if any_failed {
        process::exit(1);
    }
}

fn run_tokens(tokenizer: &str, texts: &[String]) {
    let tokenizer = tokenizer::load(tokenizer).unwrap_or_else(|e| {
        eprintln!("error: {e}");
        process::exit(1);
    });
    for text in texts {
        println!("{:?}: {:?}", text, tokenizer.encode(text));
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command {
        Command::Match {
            tokenizer,
            strict,
            ops,
            inputs,
        } => run_match(&tokenizer, strict, ops, &inputs),
        Command::Tokens { tokenizer, texts } => run_tokens(&tokenizer, &texts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_ops() {
        let parsed: Vec<OpArg> = ["one=I", "set= love| hate", "plus=#13", "any"]
            .into_iter()
            .map(|arg| arg.parse().unwrap())
            .collect();
        assert_eq!(
            format!("{parsed:?}"),
            format!(
                "{:?}",
                [
                    OpArg::One(Token::from("I")),
                    OpArg::Set(vec![Token::from(" love"), Token::from(" hate")]),
                    OpArg::Plus(Token::Id(13)),
                    OpArg::Any,
                ]
            )
        );
    }

    #[test]
    fn test_parse_op_errors() {
        assert!("one".parse::<OpArg>().is_err());
        assert!("many=a".parse::<OpArg>().is_err());
        assert!("opt=#x".parse::<OpArg>().is_err());
        assert!(r"one=\n".parse::<OpArg>().is_err());
        assert!(r"one=a\".parse::<OpArg>().is_err());
    }

    #[test]
    fn test_parse_escaped_literals() {
        let parsed: Vec<OpArg> = [r"one=\#", r"set=\||\#1| a\\b", r"star=\\"]
            .into_iter()
            .map(|arg| arg.parse().unwrap())
            .collect();
        assert_eq!(
            format!("{parsed:?}"),
            format!(
                "{:?}",
                [
                    OpArg::One(Token::from("#")),
                    OpArg::Set(vec![
                        Token::from("|"),
                        Token::from("#1"),
                        Token::from(r" a\b"),
                    ]),
                    OpArg::Star(Token::from(r"\")),
                ]
            )
        );
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
