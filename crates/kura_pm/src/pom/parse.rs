use std::borrow::Cow;

use indexmap::IndexMap;
use roxmltree::{Document, Node};
use tracing::warn;

use super::{ManagedDependency, Pom, PomError};
use crate::model::{DEFAULT_EXTENSION, Dependency, Scope};

struct DeclaredDependency {
    dependency: Dependency,
    scope: Option<Scope>,
}

impl Pom {
    /// `pom.xml` を読み込む。`${...}` 参照はこの段階では展開しない。
    pub fn parse(xml: &str) -> Result<Self, PomError> {
        let normalized = normalize_xml_entities(xml);
        let document = Document::parse(normalized.as_ref())?;
        let project = document
            .descendants()
            .find(|node| node.has_tag_name("project"))
            .ok_or(PomError::MissingProject)?;

        let parent = child(&project, "parent").map(parse_parent).transpose()?;
        let mut pom = Pom {
            group_id: node_text(&project, "groupId").unwrap_or_default(),
            artifact_id: node_text(&project, "artifactId")
                .ok_or(PomError::MissingElement("project.artifactId"))?,
            version: node_text(&project, "version").unwrap_or_default(),
            packaging: node_text(&project, "packaging").unwrap_or_else(|| "jar".to_string()),
            parent,
            properties: parse_properties(&project),
            ..Pom::default()
        };

        if let Some(management) =
            child(&project, "dependencyManagement").and_then(|node| child(&node, "dependencies"))
        {
            for node in elements(&management, "dependency") {
                let Some(declared) = parse_dependency(node)? else {
                    continue;
                };
                // `import` entries name a BOM whose managed versions are merged in.
                if declared.scope == Some(Scope::Import) && declared.dependency.extension == "pom" {
                    pom.add_dependency(Scope::Import, declared.dependency);
                    continue;
                }
                pom.add_managed(ManagedDependency {
                    group_id: declared.dependency.group_id,
                    artifact_id: declared.dependency.artifact_id,
                    version: declared.dependency.version,
                    scope: declared.scope,
                    classifier: declared.dependency.classifier,
                });
            }
        }

        if let Some(dependencies) = child(&project, "dependencies") {
            for node in elements(&dependencies, "dependency") {
                let Some(declared) = parse_dependency(node)? else {
                    continue;
                };
                pom.add_dependency(declared.scope.unwrap_or_default(), declared.dependency);
            }
        }

        Ok(pom)
    }
}

fn parse_parent(node: Node<'_, '_>) -> Result<Dependency, PomError> {
    let group_id = node_text(&node, "groupId").ok_or(PomError::MissingElement("parent.groupId"))?;
    let artifact_id =
        node_text(&node, "artifactId").ok_or(PomError::MissingElement("parent.artifactId"))?;
    let version = node_text(&node, "version").ok_or(PomError::MissingElement("parent.version"))?;
    Ok(Dependency::new(group_id, artifact_id, version).with_extension("pom"))
}

fn parse_properties(node: &Node<'_, '_>) -> IndexMap<String, String> {
    child(node, "properties")
        .map(|props| {
            props
                .children()
                .filter(|child| child.is_element())
                .filter_map(|prop| {
                    let key = prop.tag_name().name().to_string();
                    let value = prop.text().map(|text| text.trim().to_string())?;
                    Some((key, value))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_dependency(node: Node<'_, '_>) -> Result<Option<DeclaredDependency>, PomError> {
    let group_id =
        node_text(&node, "groupId").ok_or(PomError::MissingElement("dependency.groupId"))?;
    let artifact_id =
        node_text(&node, "artifactId").ok_or(PomError::MissingElement("dependency.artifactId"))?;

    let scope = match node_text(&node, "scope") {
        None => None,
        Some(raw) => match raw.parse::<Scope>() {
            Ok(scope) => Some(scope),
            Err(error) => {
                warn!(
                    dependency = %format!("{group_id}:{artifact_id}"),
                    error = %error,
                    "未知のスコープが指定された依存関係をスキップします"
                );
                return Ok(None);
            }
        },
    };

    let (extension, implied_classifier) = artifact_type(node_text(&node, "type").as_deref());
    let mut dependency = Dependency::new(
        group_id,
        artifact_id,
        node_text(&node, "version").unwrap_or_default(),
    )
    .with_extension(extension);
    dependency.classifier = node_text(&node, "classifier").or(implied_classifier);
    dependency.optional = node_text(&node, "optional")
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    dependency.exclusions = child(&node, "exclusions")
        .map(|exclusions| {
            elements(&exclusions, "exclusion")
                .filter_map(|exclusion| {
                    let group = node_text(&exclusion, "groupId")?;
                    let artifact = node_text(&exclusion, "artifactId").unwrap_or_else(|| "*".into());
                    Some(format!("{group}:{artifact}"))
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Some(DeclaredDependency { dependency, scope }))
}

/// `<type>` から拡張子と暗黙の分類子を求める。
fn artifact_type(raw: Option<&str>) -> (String, Option<String>) {
    match raw {
        None => (DEFAULT_EXTENSION.to_string(), None),
        Some("test-jar") => (DEFAULT_EXTENSION.to_string(), Some("tests".to_string())),
        Some("maven-plugin" | "ejb" | "ejb-client" | "bundle") => {
            (DEFAULT_EXTENSION.to_string(), None)
        }
        Some(other) => (other.to_string(), None),
    }
}

fn child<'a, 'input>(node: &Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|child| child.is_element() && child.tag_name().name() == tag)
}

fn elements<'a, 'input: 'a>(
    node: &Node<'a, 'input>,
    tag: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children()
        .filter(move |child| child.is_element() && child.tag_name().name() == tag)
}

fn node_text(node: &Node<'_, '_>, tag: &str) -> Option<String> {
    child(node, tag)
        .and_then(|child| child.text())
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

/// XML 標準以外の名前付き実体参照を空白に置き換える。
fn normalize_xml_entities(input: &str) -> Cow<'_, str> {
    if !input.contains('&') {
        return Cow::Borrowed(input);
    }

    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '&' {
            output.push(ch);
            continue;
        }

        let mut entity = String::new();
        while let Some(&next) = chars.peek() {
            entity.push(next);
            chars.next();
            if next == ';' || entity.len() > 32 {
                break;
            }
        }

        let known = entity.strip_suffix(';').is_some_and(|name| {
            ["lt", "gt", "amp", "quot", "apos"]
                .iter()
                .any(|known| name.eq_ignore_ascii_case(known))
                || name.starts_with('#')
        });
        if known || !entity.ends_with(';') {
            output.push('&');
            output.push_str(&entity);
        } else {
            output.push(' ');
        }
    }

    Cow::Owned(output)
}
