//! Purpose: Render bibliographic items as xml2rfc v3 `<reference>` elements.
//! Exports: `reference_xml`, `author_contributors`, `check_well_formed`, `AUTHOR_ROLES`.
//! Role: The bibxml rendition behind `?format=bibxml` and ingest validation.
//! Invariants: Output is well-formed UTF-8 with escaped text and attributes.
//! Invariants: Contributors outside the author roles never produce `<author>`.

use crate::core::error::{Error, ErrorKind};
use crate::core::record::{BibliographicItem, Contributor, Organization};
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use std::error::Error as StdError;

/// Contributor role types that map to xml2rfc `<author>` elements.
pub const AUTHOR_ROLES: [&str; 3] = ["author", "editor", "publisher"];

const IANA_NAME: &str = "Internet Assigned Numbers Authority";

fn is_author(contributor: &Contributor) -> bool {
    contributor.role.iter().any(|role| {
        role.role_type
            .as_deref()
            .is_some_and(|kind| AUTHOR_ROLES.contains(&kind))
    })
}

fn is_rfc_publisher(contributor: &Contributor) -> bool {
    contributor
        .organization
        .as_ref()
        .is_some_and(|org| org.name.iter().any(|name| name.content == "RFC Publisher"))
}

/// Contributors that render as `<author>`: author/editor/publisher roles,
/// excluding the RFC Publisher organization.
pub fn author_contributors(item: &BibliographicItem) -> Vec<&Contributor> {
    item.contributor
        .iter()
        .filter(|contributor| is_author(contributor) && !is_rfc_publisher(contributor))
        .collect()
}

fn wx<E: StdError + Send + Sync + 'static>(err: E) -> Error {
    Error::new(ErrorKind::Internal)
        .with_message("xml write failed")
        .with_source(err)
}

/// Renders the xml2rfc v3 `<reference>` rendition of an item.
pub fn reference_xml(item: &BibliographicItem, anchor: &str) -> Result<String, Error> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    let mut reference = BytesStart::new("reference");
    reference.push_attribute(("anchor", anchor));
    if let Some(target) = target_uri(item) {
        reference.push_attribute(("target", target));
    }
    writer.write_event(Event::Start(reference)).map_err(wx)?;

    writer
        .write_event(Event::Start(BytesStart::new("front")))
        .map_err(wx)?;

    writer
        .write_event(Event::Start(BytesStart::new("title")))
        .map_err(wx)?;
    writer
        .write_event(Event::Text(BytesText::new(item.main_title().unwrap_or(anchor))))
        .map_err(wx)?;
    writer
        .write_event(Event::End(BytesEnd::new("title")))
        .map_err(wx)?;

    for contributor in author_contributors(item) {
        write_author(&mut writer, contributor)?;
    }

    if let Some(date) = item.published_date() {
        let mut el = BytesStart::new("date");
        let (year, month, day) = split_date(date);
        if let Some(year) = year {
            el.push_attribute(("year", year.as_str()));
        }
        if let Some(month) = month {
            el.push_attribute(("month", month.as_str()));
        }
        if let Some(day) = day {
            el.push_attribute(("day", day.as_str()));
        }
        writer.write_event(Event::Empty(el)).map_err(wx)?;
    }

    if let Some(abstract_text) = item.abstracts.first() {
        writer
            .write_event(Event::Start(BytesStart::new("abstract")))
            .map_err(wx)?;
        writer
            .write_event(Event::Start(BytesStart::new("t")))
            .map_err(wx)?;
        writer
            .write_event(Event::Text(BytesText::new(&abstract_text.content)))
            .map_err(wx)?;
        writer
            .write_event(Event::End(BytesEnd::new("t")))
            .map_err(wx)?;
        writer
            .write_event(Event::End(BytesEnd::new("abstract")))
            .map_err(wx)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("front")))
        .map_err(wx)?;

    for series in &item.series {
        let (Some(title), Some(number)) = (series.title.as_ref(), series.number.as_deref()) else {
            continue;
        };
        let mut el = BytesStart::new("seriesInfo");
        el.push_attribute(("name", title.content.as_str()));
        el.push_attribute(("value", number));
        writer.write_event(Event::Empty(el)).map_err(wx)?;
    }
    for docid in &item.docid {
        if docid.id_type.as_deref() != Some("DOI") {
            continue;
        }
        let Some(id) = docid.id.as_deref() else {
            continue;
        };
        let mut el = BytesStart::new("seriesInfo");
        el.push_attribute(("name", "DOI"));
        el.push_attribute(("value", id));
        writer.write_event(Event::Empty(el)).map_err(wx)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("reference")))
        .map_err(wx)?;

    String::from_utf8(writer.into_inner()).map_err(wx)
}

fn write_author(writer: &mut Writer<Vec<u8>>, contributor: &Contributor) -> Result<(), Error> {
    let mut author = BytesStart::new("author");

    let is_editor = contributor
        .role
        .iter()
        .any(|role| role.role_type.as_deref() == Some("editor"));
    if is_editor {
        author.push_attribute(("role", "editor"));
    }

    let org: Option<&Organization> = contributor.organization.as_ref().or_else(|| {
        contributor
            .person
            .as_ref()
            .and_then(|person| person.affiliation.first())
            .and_then(|affiliation| affiliation.organization.as_ref())
    });

    let mut initials: Vec<String> = Vec::new();
    if let Some(person) = &contributor.person {
        let name = &person.name;
        if let Some(given) = &name.given {
            initials = given
                .formatted_initials
                .iter()
                .map(|value| value.content.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect();
        }

        let fullname = if let Some(completename) = &name.completename {
            completename.content.clone()
        } else {
            let forenames = name.given.as_ref().map(|given| {
                given
                    .forename
                    .iter()
                    .map(|value| value.content.as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
            });
            let mut parts: Vec<String> = Vec::new();
            if let Some(prefix) = &name.prefix {
                parts.push(prefix.content.clone());
            }
            if let Some(forenames) = forenames.filter(|text| !text.is_empty()) {
                parts.push(forenames);
            }
            if !initials.is_empty() {
                parts.push(initials.join(" "));
            }
            if let Some(surname) = &name.surname {
                parts.push(surname.content.clone());
            }
            if let Some(addition) = &name.addition {
                parts.push(addition.content.clone());
            }
            parts.join(" ")
        };
        if !fullname.is_empty() {
            author.push_attribute(("fullname", fullname.as_str()));
        }
        if let Some(surname) = &name.surname {
            author.push_attribute(("surname", surname.content.as_str()));
        }
        if !initials.is_empty() {
            author.push_attribute(("initials", initials.join(" ").as_str()));
        }
    }

    let has_org_body = org.is_some();
    if has_org_body {
        writer.write_event(Event::Start(author)).map_err(wx)?;
    } else {
        writer.write_event(Event::Empty(author)).map_err(wx)?;
        return Ok(());
    }

    if let Some(org) = org {
        let is_iana = org
            .abbreviation
            .as_ref()
            .is_some_and(|abbr| abbr.content == "IANA")
            || org.name.iter().any(|name| name.content == IANA_NAME);

        let mut org_el = BytesStart::new("organization");
        let org_text = if is_iana {
            "IANA".to_string()
        } else {
            if let Some(abbr) = &org.abbreviation {
                org_el.push_attribute(("abbrev", abbr.content.as_str()));
            }
            org.name
                .first()
                .map(|name| name.content.clone())
                .unwrap_or_default()
        };
        writer.write_event(Event::Start(org_el)).map_err(wx)?;
        writer
            .write_event(Event::Text(BytesText::new(&org_text)))
            .map_err(wx)?;
        writer
            .write_event(Event::End(BytesEnd::new("organization")))
            .map_err(wx)?;

        let postal = org
            .contact
            .iter()
            .filter_map(|contact| contact.address.as_ref())
            .find(|address| address.country.is_some());
        if postal.is_some() || org.url.is_some() {
            writer
                .write_event(Event::Start(BytesStart::new("address")))
                .map_err(wx)?;
            if let Some(address) = postal {
                writer
                    .write_event(Event::Start(BytesStart::new("postal")))
                    .map_err(wx)?;
                if let Some(country) = address.country.as_deref() {
                    writer
                        .write_event(Event::Start(BytesStart::new("country")))
                        .map_err(wx)?;
                    writer
                        .write_event(Event::Text(BytesText::new(country)))
                        .map_err(wx)?;
                    writer
                        .write_event(Event::End(BytesEnd::new("country")))
                        .map_err(wx)?;
                }
                if let Some(city) = address.city.as_deref() {
                    writer
                        .write_event(Event::Start(BytesStart::new("city")))
                        .map_err(wx)?;
                    writer
                        .write_event(Event::Text(BytesText::new(city)))
                        .map_err(wx)?;
                    writer
                        .write_event(Event::End(BytesEnd::new("city")))
                        .map_err(wx)?;
                }
                writer
                    .write_event(Event::End(BytesEnd::new("postal")))
                    .map_err(wx)?;
            }
            if let Some(url) = org.url.as_deref() {
                writer
                    .write_event(Event::Start(BytesStart::new("uri")))
                    .map_err(wx)?;
                writer
                    .write_event(Event::Text(BytesText::new(url)))
                    .map_err(wx)?;
                writer
                    .write_event(Event::End(BytesEnd::new("uri")))
                    .map_err(wx)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new("address")))
                .map_err(wx)?;
        }
    }

    writer
        .write_event(Event::End(BytesEnd::new("author")))
        .map_err(wx)?;
    Ok(())
}

fn target_uri(item: &BibliographicItem) -> Option<&str> {
    item.link
        .iter()
        .find(|link| link.link_type.as_deref() == Some("src"))
        .or_else(|| item.link.first())
        .map(|link| link.content.as_str())
        .filter(|content| !content.is_empty())
}

fn split_date(value: &str) -> (Option<String>, Option<String>, Option<String>) {
    let mut parts = value.splitn(3, '-');
    let year = parts
        .next()
        .filter(|part| !part.is_empty())
        .map(str::to_string);
    let month = parts
        .next()
        .and_then(|part| part.parse::<u8>().ok())
        .and_then(month_name)
        .map(str::to_string);
    let day = parts
        .next()
        .and_then(|part| part.parse::<u8>().ok())
        .map(|day| day.to_string());
    (year, month, day)
}

fn month_name(month: u8) -> Option<&'static str> {
    match month {
        1 => Some("January"),
        2 => Some("February"),
        3 => Some("March"),
        4 => Some("April"),
        5 => Some("May"),
        6 => Some("June"),
        7 => Some("July"),
        8 => Some("August"),
        9 => Some("September"),
        10 => Some("October"),
        11 => Some("November"),
        12 => Some("December"),
        _ => None,
    }
}

/// Walks the document once, failing with `Corrupt` on malformed XML.
pub fn check_well_formed(xml: &str) -> Result<(), Error> {
    let mut reader = Reader::from_str(xml);
    let mut depth = 0i64;
    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => depth += 1,
            Ok(Event::End(_)) => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::new(ErrorKind::Corrupt)
                        .with_message("xml has unbalanced end tag"));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("xml is not well formed")
                    .with_source(err));
            }
        }
    }
    if depth != 0 {
        return Err(Error::new(ErrorKind::Corrupt).with_message("xml has unclosed elements"));
    }
    Ok(())
}
