use crate::convert::{GitCommitMeta, GitTagMeta, MetaMaker};
use crate::svn::Properties;
use crate::user_map::UserMap;

pub(crate) const DEFAULT_USER_FALLBACK_TEMPLATE: &str = r#"{{ svn_author or "no-author" }} <{{ svn_author or "no-author" }}{% if svn_uuid %}@{{ svn_uuid }}{% endif %}>"#;

pub(crate) const DEFAULT_COMMIT_MSG_TEMPLATE: &str = indoc::indoc! {r#"
    {% if svn_log %}{{ svn_log }}

    {% endif %}[[SVN revision: {{ svn_rev }}]]{% if svn_path %}
    [[SVN path: {{ svn_path }}]]{% endif %}
"#};

pub(crate) const DEFAULT_TAG_MSG_TEMPLATE: &str = indoc::indoc! {r#"
    {% if svn_log %}{{ svn_log }}

    {% endif %}[[SVN revision: {{ svn_rev }}]]
    [[SVN path: {{ svn_path }}]]
"#};

/// Renders git metadata with the user map and `minijinja` templates.
pub(crate) struct GitMetaMaker<'a> {
    user_map: &'a UserMap,
    jinja_env: minijinja::Environment<'a>,
}

impl<'a> GitMetaMaker<'a> {
    pub(crate) fn new(
        user_map: &'a UserMap,
        user_fallback_template: &'a str,
        commit_msg_template: &'a str,
        tag_msg_template: &'a str,
    ) -> Result<Self, String> {
        let mut jinja_env = minijinja::Environment::empty();
        jinja_env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);

        jinja_env
            .add_template("user_fallback", user_fallback_template)
            .map_err(|e| format!("failed to parse user fallback template: {e}"))?;
        jinja_env
            .add_template("commit_msg", commit_msg_template)
            .map_err(|e| format!("failed to parse commit message template: {e}"))?;
        jinja_env
            .add_template("tag_msg", tag_msg_template)
            .map_err(|e| format!("failed to parse tag message template: {e}"))?;

        Ok(Self {
            user_map,
            jinja_env,
        })
    }

    fn render(&self, name: &str, what: &str, ctx: &JinjaCtx) -> Result<String, String> {
        self.jinja_env
            .get_template(name)
            .and_then(|template| template.render(ctx))
            .map_err(|e| format!("failed to render {what}: {e}"))
    }

    fn signature(
        &self,
        ctx: &JinjaCtx,
        svn_rev_no: u32,
        svn_rev_props: &Properties,
    ) -> Result<gix_actor::Signature, String> {
        let svn_author = get_prop(svn_rev_props, b"svn:author");
        let (name, email) = self.convert_author(ctx, svn_rev_no, svn_author)?;
        let seconds = extract_rev_date(svn_rev_props)?
            .map_or(0, |date| date.and_utc().timestamp());
        Ok(gix_actor::Signature {
            name: name.into(),
            email: email.into(),
            time: gix_date::Time {
                seconds,
                offset: 0,
            },
        })
    }

    fn convert_author(
        &self,
        ctx: &JinjaCtx,
        svn_rev_no: u32,
        svn_author: Option<&[u8]>,
    ) -> Result<(String, String), String> {
        if let Some(identity) =
            svn_author.and_then(|svn_author| self.user_map.get(svn_author, svn_rev_no))
        {
            return Ok((identity.name.clone(), identity.email.clone()));
        }
        let author = self.render("user_fallback", "fallback author", ctx)?;
        let Some((name, email)) = split_author_name_email(&author) else {
            return Err(format!("author {author:?} is not in \"name <email>\" format"));
        };
        Ok((name.into(), email.into()))
    }
}

impl MetaMaker for GitMetaMaker<'_> {
    fn commit_meta(
        &self,
        svn_uuid: Option<&uuid::Uuid>,
        svn_rev_no: u32,
        svn_path: &[u8],
        svn_rev_props: &Properties,
    ) -> Result<GitCommitMeta, String> {
        let ctx = JinjaCtx::new(svn_uuid, svn_rev_no, svn_path, svn_rev_props, self.user_map);
        let author = self.signature(&ctx, svn_rev_no, svn_rev_props)?;
        let message = self
            .render("commit_msg", "git commit message", &ctx)?
            .replace("\r\n", "\n");

        Ok(GitCommitMeta {
            committer: author.clone(),
            author,
            message,
        })
    }

    fn tag_meta(
        &self,
        svn_uuid: Option<&uuid::Uuid>,
        svn_rev_no: u32,
        svn_path: &[u8],
        svn_rev_props: &Properties,
    ) -> Result<GitTagMeta, String> {
        let ctx = JinjaCtx::new(svn_uuid, svn_rev_no, svn_path, svn_rev_props, self.user_map);
        let tagger = self.signature(&ctx, svn_rev_no, svn_rev_props)?;
        let message = self
            .render("tag_msg", "git tag message", &ctx)?
            .replace("\r\n", "\n");

        Ok(GitTagMeta {
            tagger: Some(tagger),
            message,
        })
    }
}

fn get_prop<'a>(props: &'a Properties, key: &[u8]) -> Option<&'a [u8]> {
    props.get(key).map(Vec::as_slice)
}

fn extract_rev_date(svn_rev_props: &Properties) -> Result<Option<chrono::NaiveDateTime>, String> {
    get_prop(svn_rev_props, b"svn:date")
        .map(|raw_date| {
            std::str::from_utf8(raw_date)
                .ok()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|date| date.naive_utc())
                .ok_or_else(|| format!("invalid SVN revision date \"{}\"", raw_date.escape_ascii()))
        })
        .transpose()
}

#[derive(serde::Serialize)]
struct JinjaCtx {
    svn_uuid: String,
    svn_rev: u32,
    svn_author: String,
    svn_log: String,
    svn_path: String,
    mapped_author_name: String,
    mapped_author_email: String,
}

impl JinjaCtx {
    fn new(
        uuid: Option<&uuid::Uuid>,
        rev_no: u32,
        branch_path: &[u8],
        svn_rev_props: &Properties,
        user_map: &UserMap,
    ) -> Self {
        let svn_author = get_prop(svn_rev_props, b"svn:author");
        let svn_log = get_prop(svn_rev_props, b"svn:log");

        let (mapped_author_name, mapped_author_email) = svn_author
            .and_then(|svn_author| user_map.get(svn_author, rev_no))
            .map(|identity| (identity.name.clone(), identity.email.clone()))
            .unwrap_or_default();

        Self {
            svn_uuid: uuid.map(ToString::to_string).unwrap_or_default(),
            svn_rev: rev_no,
            svn_log: String::from_utf8_lossy(svn_log.unwrap_or_default()).into_owned(),
            svn_author: String::from_utf8_lossy(svn_author.unwrap_or_default()).into_owned(),
            svn_path: String::from_utf8_lossy(branch_path).into_owned(),
            mapped_author_name,
            mapped_author_email,
        }
    }
}

fn split_author_name_email(raw: &str) -> Option<(&str, &str)> {
    if raw.contains('\n') {
        return None;
    }

    let i_lt = raw.find('<')?;

    let name = raw[..i_lt].trim_matches(' ');
    let email = raw[(i_lt + 1)..]
        .trim_end_matches(' ')
        .strip_suffix('>')?
        .trim_matches(' ');

    Some((name, email))
}

#[cfg(test)]
mod tests {
    use super::{
        DEFAULT_COMMIT_MSG_TEMPLATE, DEFAULT_TAG_MSG_TEMPLATE, DEFAULT_USER_FALLBACK_TEMPLATE,
        GitMetaMaker, split_author_name_email,
    };
    use crate::convert::MetaMaker as _;
    use crate::svn::Properties;
    use crate::user_map::UserMap;

    fn props(author: &str, log: &str) -> Properties {
        Properties::from([
            (b"svn:author".to_vec(), author.as_bytes().to_vec()),
            (b"svn:date".to_vec(), b"2009-04-11T12:00:00.000000Z".to_vec()),
            (b"svn:log".to_vec(), log.as_bytes().to_vec()),
        ])
    }

    #[test]
    fn test_commit_meta() {
        let user_map = UserMap::parse(&mut &b"alice = Alice A. <alice@example.com>\n"[..]).unwrap();
        let maker = GitMetaMaker::new(
            &user_map,
            DEFAULT_USER_FALLBACK_TEMPLATE,
            DEFAULT_COMMIT_MSG_TEMPLATE,
            DEFAULT_TAG_MSG_TEMPLATE,
        )
        .unwrap();

        let meta = maker
            .commit_meta(None, 3, b"trunk", &props("alice", "fix things"))
            .unwrap();
        assert_eq!(meta.author.name, "Alice A.");
        assert_eq!(meta.author.email, "alice@example.com");
        assert_eq!(meta.author.time.seconds, 1239451200);
        assert_eq!(meta.committer, meta.author);
        assert_eq!(
            meta.message,
            "fix things\n\n[[SVN revision: 3]]\n[[SVN path: trunk]]",
        );

        let meta = maker
            .commit_meta(None, 4, b"", &props("bob", ""))
            .unwrap();
        assert_eq!(meta.author.name, "bob");
        assert_eq!(meta.author.email, "bob");
        assert_eq!(meta.message, "[[SVN revision: 4]]");

        let tag = maker
            .tag_meta(None, 5, b"tags/v1", &props("alice", ""))
            .unwrap();
        assert_eq!(tag.tagger.unwrap().name, "Alice A.");
        assert_eq!(tag.message, "[[SVN revision: 5]]\n[[SVN path: tags/v1]]");
    }

    #[test]
    fn test_bad_fallback() {
        let user_map = UserMap::new();
        let maker = GitMetaMaker::new(&user_map, "{{ svn_author }}", "x", "y").unwrap();
        assert!(maker.commit_meta(None, 1, b"", &props("bob", "")).is_err());
    }

    #[test]
    fn test_split_author() {
        assert_eq!(
            split_author_name_email("A B <a@b>"),
            Some(("A B", "a@b")),
        );
        assert_eq!(split_author_name_email("A B"), None);
        assert_eq!(split_author_name_email("A <a>\n"), None);
    }
}
