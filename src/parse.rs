use chrono::Utc;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::Value;
use tokio::task::spawn_blocking;

use crate::{request::Profile, Error, Result};

#[derive(Deserialize)]
struct WebProfileInfo {
    data: Option<WebProfileData>,
}

#[derive(Deserialize)]
struct WebProfileData {
    user: Option<WebUser>,
}

#[derive(Deserialize)]
struct WebUser {
    id: String,
    username: String,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    biography: Option<String>,
    #[serde(default)]
    external_url: Option<String>,
    edge_followed_by: EdgeCount,
    edge_follow: EdgeCount,
}

#[derive(Deserialize)]
struct EdgeCount {
    count: u64,
}

/// Parses the `web_profile_info` JSON. `Ok(None)` means Instagram has no such user.
pub(crate) fn parse_profile_json(body: &str) -> Result<Option<Profile>> {
    let info: WebProfileInfo = serde_json::from_str(body)?;
    let Some(user) = info.data.and_then(|d| d.user) else {
        return Ok(None);
    };
    let userid = user
        .id
        .parse()
        .map_err(|_| Error::UnexpectedPayload(format!("non numeric user id {:?}", user.id)))?;

    Ok(Some(Profile {
        profile_url: Profile::url_for(&user.username),
        username: user.username,
        full_name: user.full_name.unwrap_or_default(),
        userid,
        biography: user.biography.unwrap_or_default(),
        external_url: user.external_url.filter(|u| !u.is_empty()),
        followers: user.edge_followed_by.count,
        following: user.edge_follow.count,
        collected_at: Utc::now(),
    }))
}

#[derive(Deserialize)]
struct LdProfilePage {
    #[serde(rename = "@type")]
    kind: String,
    #[serde(rename = "mainEntity")]
    main_entity: LdPerson,
}

#[derive(Deserialize)]
struct LdPerson {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "alternateName", default)]
    alternate_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    identifier: Option<LdIdentifier>,
    #[serde(default)]
    url: Option<String>,
    #[serde(rename = "interactionStatistic", default)]
    interaction_statistic: Vec<LdCounter>,
}

#[derive(Deserialize)]
struct LdIdentifier {
    value: Value,
}

#[derive(Deserialize)]
struct LdCounter {
    #[serde(rename = "interactionType")]
    interaction_type: String,
    #[serde(rename = "userInteractionCount")]
    user_interaction_count: Value,
}

/// Reads the `ProfilePage` JSON-LD block of a public profile page.
/// The page doesn't expose the following count, it is reported as 0.
pub(crate) async fn parse_profile_html(username: &str, html: String) -> Result<Profile> {
    let username = username.to_string();
    spawn_blocking(move || -> Result<Profile> {
        let doc = Html::parse_document(&html);
        let ld_selector = create_selector(r#"script[type="application/ld+json"]"#)?;

        let page = doc
            .select(&ld_selector)
            .filter_map(|script| {
                let text = script.text().collect::<String>();
                serde_json::from_str::<LdProfilePage>(&text).ok()
            })
            .find(|page| page.kind == "ProfilePage")
            .ok_or_else(|| Error::ParseMissingSelector("ProfilePage ld+json".into()))?;

        let person = page.main_entity;
        let handle = person
            .alternate_name
            .as_deref()
            .map(|n| n.trim_start_matches('@').to_string())
            .unwrap_or(username);
        let userid = person
            .identifier
            .as_ref()
            .and_then(|id| as_u64(&id.value))
            .ok_or_else(|| Error::UnexpectedPayload(format!("no user id for {handle}")))?;
        let followers = person
            .interaction_statistic
            .iter()
            .find(|c| c.interaction_type.ends_with("FollowAction"))
            .and_then(|c| as_u64(&c.user_interaction_count))
            .unwrap_or(0);

        Ok(Profile {
            profile_url: Profile::url_for(&handle),
            username: handle,
            full_name: person.name.unwrap_or_default(),
            userid,
            biography: person.description.unwrap_or_default(),
            external_url: person.url.filter(|u| !u.is_empty()),
            followers,
            following: 0,
            collected_at: Utc::now(),
        })
    })
    .await?
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[inline]
fn create_selector(sel_str: &str) -> Result<Selector> {
    Selector::parse(sel_str).map_err(|_| Error::ParseMissingSelector(sel_str.into()))
}
