//! Line parsers for the `.rarconfig` format.

use anyhow::{bail, Error};

use nom::{
    bytes::complete::{tag, take_while, take_while1},
    character::complete::char,
    combinator::all_consuming,
    error::VerboseError,
    sequence::delimited,
};

pub type IResult<'a, O> = Result<(&'a str, O), nom::Err<VerboseError<&'a str>>>;

/// Recognizes zero or more spaces and tabs.
fn multispace0(i: &str) -> IResult<&str> {
    take_while(|c| c == ' ' || c == '\t')(i)
}

fn quoted(i: &str) -> IResult<&str> {
    delimited(char('"'), take_while(|c| c != '"'), char('"'))(i)
}

/// `[ /path/to/archive.rar ]`
fn section_heading(i: &str) -> IResult<&str> {
    let (i, _) = char('[')(i)?;
    let (i, _) = multispace0(i)?;
    let (i, path) = take_while1(|c| c != ']')(i)?;
    let (i, _) = char(']')(i)?;
    let (i, _) = multispace0(i)?;
    Ok((i, path.trim_end()))
}

/// `"original", "alias"`
fn alias_pair(i: &str) -> IResult<(&str, &str)> {
    let (i, _) = multispace0(i)?;
    let (i, file) = quoted(i)?;
    let (i, _) = multispace0(i)?;
    let (i, _) = tag(",")(i)?;
    let (i, _) = multispace0(i)?;
    let (i, alias) = quoted(i)?;
    let (i, _) = multispace0(i)?;
    Ok((i, (file, alias)))
}

fn quoted_value(i: &str) -> IResult<&str> {
    let (i, _) = multispace0(i)?;
    let (i, value) = quoted(i)?;
    let (i, _) = multispace0(i)?;
    Ok((i, value))
}

/// Parse one complete line, turning parser misses into readable errors.
fn complete_line<'a, F, O>(what: &str, i: &'a str, parser: F) -> Result<O, Error>
where
    F: Fn(&'a str) -> IResult<'a, O>,
{
    match all_consuming(parser)(i) {
        Err(nom::Err::Error(VerboseError { errors })) | Err(nom::Err::Failure(VerboseError { errors })) => {
            if errors.is_empty() {
                bail!("unable to parse {}", what);
            } else {
                bail!("unable to parse {} at '{}'", what, errors[0].0);
            }
        }
        Err(err) => bail!("unable to parse {} - {}", what, err),
        Ok((_, data)) => Ok(data),
    }
}

pub fn parse_section(line: &str) -> Result<&str, Error> {
    complete_line("section heading", line, section_heading)
}

pub fn parse_alias_value(value: &str) -> Result<(&str, &str), Error> {
    complete_line("alias value", value, alias_pair)
}

pub fn parse_quoted_value(value: &str) -> Result<&str, Error> {
    complete_line("quoted value", value, quoted_value)
}

/// `key = value` with surrounding whitespace; the value keeps its spelling.
pub fn split_key_value(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_headings() {
        assert_eq!(parse_section("[/data/a.rar]").unwrap(), "/data/a.rar");
        assert_eq!(parse_section("[ /data/a.rar ]").unwrap(), "/data/a.rar");
        assert!(parse_section("[/data/a.rar").is_err());
        assert!(parse_section("nope").is_err());
        assert!(parse_section("[]").is_err());
    }

    #[test]
    fn alias_values() {
        assert_eq!(
            parse_alias_value(r#""/d/old.mkv", "/d/new.mkv""#).unwrap(),
            ("/d/old.mkv", "/d/new.mkv")
        );
        assert_eq!(
            parse_alias_value(r#"  "a" ,  "b"  "#).unwrap(),
            ("a", "b")
        );
        assert!(parse_alias_value(r#""only one""#).is_err());
        assert!(parse_alias_value("a, b").is_err());
    }

    #[test]
    fn quoted_values() {
        assert_eq!(parse_quoted_value(r#""s3cr3t""#).unwrap(), "s3cr3t");
        assert_eq!(parse_quoted_value(r#" "with space" "#).unwrap(), "with space");
        assert!(parse_quoted_value("bare").is_err());
    }

    #[test]
    fn key_value_splitting() {
        assert_eq!(
            split_key_value("seek-length = 4096"),
            Some(("seek-length", "4096"))
        );
        assert_eq!(
            split_key_value("password=\"x=y\""),
            Some(("password", "\"x=y\""))
        );
        assert_eq!(split_key_value("no equals here"), None);
        assert_eq!(split_key_value("= value"), None);
    }
}
