use url::Url;

use super::ParseError;

/// Iterator over the `KEY=VALUE` pairs of a tag's attribute list.
///
/// Values may be quoted strings containing commas; commas inside quotes do
/// not split attributes. Quotes are kept on the value and removed with
/// [strip_quotes].
pub struct Attributes<'a> {
	rest: Option<&'a str>,
}

impl<'a> Attributes<'a> {
	pub fn new(data: &'a str) -> Self {
		Self { rest: Some(data) }
	}
}

impl<'a> Iterator for Attributes<'a> {
	type Item = Result<(&'a str, &'a str), ParseError>;

	fn next(&mut self) -> Option<Self::Item> {
		let data = self.rest.take()?.trim_start_matches(' ');
		if data.is_empty() {
			return None;
		}

		let Some((name, value)) = data.split_once('=') else {
			return Some(Err(ParseError::MissingEquals));
		};
		if name.is_empty() {
			return Some(Err(ParseError::MissingEquals));
		}

		// a quoted value may contain commas; skip to its closing quote
		let quoted_len = if let Some(quoted) = value.strip_prefix('"') {
			match quoted.find('"') {
				Some(end) => end + 2,
				None => return Some(Err(ParseError::UnterminatedQuote)),
			}
		} else {
			0
		};

		let value = match value[quoted_len..].find(',') {
			Some(comma) => {
				let end = quoted_len + comma;
				self.rest = Some(&value[end + 1..]);
				&value[..end]
			}
			None => value,
		};

		Some(Ok((name, value)))
	}
}

/// Strip the surrounding quotes off an attribute value, or `None` when the
/// value is not quoted.
pub fn strip_quotes(value: &str) -> Option<&str> {
	let inner = value.strip_prefix('"')?;
	let end = inner.find('"')?;
	Some(&inner[..end])
}

/// Parse a literal `YES`/`NO` boolean.
pub fn parse_bool(value: &str) -> Option<bool> {
	match value {
		"YES" => Some(true),
		"NO" => Some(false),
		_ => None,
	}
}

/// Parse a `WIDTHxHEIGHT` resolution.
pub fn parse_resolution(value: &str) -> Option<(u32, u32)> {
	let (width, height) = value.split_once('x')?;
	Some((width.parse().ok()?, height.parse().ok()?))
}

/// Parse a `length[@offset]` byte range.
pub fn parse_byte_range(value: &str) -> Option<(u64, Option<u64>)> {
	match value.split_once('@') {
		Some((length, offset)) => Some((length.parse().ok()?, Some(offset.parse().ok()?))),
		None => Some((value.parse().ok()?, None)),
	}
}

/// Resolve a possibly-relative uri against the playlist's own uri.
pub fn join_uri(base: &Url, value: &str) -> Result<Url, ParseError> {
	if let Ok(url) = Url::parse(value) {
		return Ok(url);
	}

	base.join(value).map_err(|_| ParseError::InvalidUri(value.to_string()))
}

pub(crate) fn parse_u64(value: &str) -> Result<u64, ParseError> {
	value
		.trim()
		.parse()
		.map_err(|_| ParseError::InvalidNumber(value.to_string()))
}

pub(crate) fn parse_u32(value: &str) -> Result<u32, ParseError> {
	value
		.trim()
		.parse()
		.map_err(|_| ParseError::InvalidNumber(value.to_string()))
}

pub(crate) fn parse_f64(value: &str) -> Result<f64, ParseError> {
	let parsed: f64 = value
		.trim()
		.parse()
		.map_err(|_| ParseError::InvalidNumber(value.to_string()))?;

	if !parsed.is_finite() || parsed < 0.0 {
		return Err(ParseError::InvalidNumber(value.to_string()));
	}

	Ok(parsed)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn collect(data: &str) -> Vec<(&str, &str)> {
		Attributes::new(data).map(|attr| attr.unwrap()).collect()
	}

	#[test]
	fn simple_attributes() {
		assert_eq!(
			collect("BANDWIDTH=1280000,PROGRAM-ID=1"),
			[("BANDWIDTH", "1280000"), ("PROGRAM-ID", "1")]
		);
	}

	#[test]
	fn quoted_value_with_commas() {
		assert_eq!(
			collect(r#"CODECS="mp4a.40.2,avc1.4d401e",RESOLUTION=1280x720"#),
			[("CODECS", r#""mp4a.40.2,avc1.4d401e""#), ("RESOLUTION", "1280x720")]
		);
	}

	#[test]
	fn leading_spaces() {
		assert_eq!(collect("A=1, B=2"), [("A", "1"), ("B", "2")]);
	}

	#[test]
	fn missing_equals() {
		let mut attrs = Attributes::new("BANDWIDTH");
		assert_eq!(attrs.next(), Some(Err(ParseError::MissingEquals)));

		let mut attrs = Attributes::new("=1");
		assert_eq!(attrs.next(), Some(Err(ParseError::MissingEquals)));
	}

	#[test]
	fn unterminated_quote() {
		let mut attrs = Attributes::new(r#"URI="http://example.com"#);
		assert_eq!(attrs.next(), Some(Err(ParseError::UnterminatedQuote)));
	}

	#[test]
	fn quotes() {
		assert_eq!(strip_quotes(r#""hello""#), Some("hello"));
		assert_eq!(strip_quotes("hello"), None);
		assert_eq!(strip_quotes(r#""hello"#), None);
	}

	#[test]
	fn booleans() {
		assert_eq!(parse_bool("YES"), Some(true));
		assert_eq!(parse_bool("NO"), Some(false));
		assert_eq!(parse_bool("yes"), None);
	}

	#[test]
	fn resolutions() {
		assert_eq!(parse_resolution("1280x720"), Some((1280, 720)));
		assert_eq!(parse_resolution("1280"), None);
		assert_eq!(parse_resolution("1280x"), None);
	}

	#[test]
	fn byte_ranges() {
		assert_eq!(parse_byte_range("100"), Some((100, None)));
		assert_eq!(parse_byte_range("100@200"), Some((100, Some(200))));
		assert_eq!(parse_byte_range("abc"), None);
		assert_eq!(parse_byte_range("100@"), None);
	}

	#[test]
	fn uri_joining() {
		let base = Url::parse("http://example.com/live/stream.m3u8").unwrap();

		// relative to the base's directory
		assert_eq!(
			join_uri(&base, "seg1.ts").unwrap().as_str(),
			"http://example.com/live/seg1.ts"
		);

		// a rooted path replaces the entire path
		assert_eq!(
			join_uri(&base, "/other/seg1.ts").unwrap().as_str(),
			"http://example.com/other/seg1.ts"
		);

		// absolute uris are used verbatim
		assert_eq!(
			join_uri(&base, "https://cdn.example.com/seg1.ts").unwrap().as_str(),
			"https://cdn.example.com/seg1.ts"
		);
	}
}
