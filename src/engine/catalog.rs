use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Content records the scheduler reads durations from.
///
/// Lookups are lock-free; all writes happen while the engine holds the
/// timeline write lock, so they are serialized with schedule mutations.
pub struct ContentCatalog {
    contents: DashMap<Ulid, Content>,
}

impl Default for ContentCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentCatalog {
    pub fn new() -> Self {
        Self {
            contents: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.contents.contains_key(id)
    }

    pub fn get(&self, id: &Ulid) -> Option<Content> {
        self.contents.get(id).map(|e| e.value().clone())
    }

    /// Default duration of a content item, `None` if it has none.
    pub fn default_duration(&self, id: &Ulid) -> Result<Option<Secs>, EngineError> {
        self.contents
            .get(id)
            .map(|e| e.value().default_duration)
            .ok_or(EngineError::ContentNotFound(*id))
    }

    /// All contents ordered by id.
    pub fn list(&self) -> Vec<Content> {
        let mut all: Vec<Content> = self.contents.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|c| c.id);
        all
    }

    pub(super) fn insert(&self, content: Content) {
        self.contents.insert(content.id, content);
    }

    pub(super) fn update(&self, id: &Ulid, title: String, default_duration: Option<Secs>) {
        if let Some(mut c) = self.contents.get_mut(id) {
            c.title = title;
            c.default_duration = default_duration;
        }
    }

    pub(super) fn remove(&self, id: &Ulid) -> Option<Content> {
        self.contents.remove(id).map(|(_, c)| c)
    }
}

pub(crate) fn validate_title(title: &str) -> Result<(), EngineError> {
    if title.trim().is_empty() {
        return Err(EngineError::InvalidContent("title is required"));
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    Ok(())
}

pub(crate) fn validate_default_duration(d: Option<Secs>) -> Result<(), EngineError> {
    match d {
        Some(secs) if secs <= 0 => Err(EngineError::InvalidDuration(secs)),
        Some(secs) if secs > MAX_DURATION_SECS => Err(EngineError::LimitExceeded("duration too long")),
        _ => Ok(()),
    }
}

pub(crate) fn validate_content(content: &Content) -> Result<(), EngineError> {
    validate_title(&content.title)?;
    validate_default_duration(content.default_duration)?;
    if content.owner.len() > MAX_OWNER_LEN {
        return Err(EngineError::LimitExceeded("owner too long"));
    }
    let bodies: Vec<&str> = match &content.kind {
        ContentKind::Video { url } => vec![url.as_str()],
        ContentKind::Banner { image_url, text } => {
            let mut v = vec![image_url.as_str()];
            v.extend(text.as_deref());
            v
        }
        ContentKind::Text { text } => vec![text.as_str()],
    };
    if bodies[0].trim().is_empty() {
        return Err(EngineError::InvalidContent("content body is required"));
    }
    if bodies.iter().any(|b| b.len() > MAX_BODY_LEN) {
        return Err(EngineError::LimitExceeded("content body too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(duration: Option<Secs>) -> Content {
        Content {
            id: Ulid::new(),
            title: "Intro".into(),
            kind: ContentKind::Video { url: "https://cdn/intro.mp4".into() },
            default_duration: duration,
            owner: SYSTEM_OWNER.into(),
        }
    }

    #[test]
    fn insert_get_update_remove() {
        let cat = ContentCatalog::new();
        let c = video(Some(10));
        cat.insert(c.clone());
        assert!(cat.contains(&c.id));
        assert_eq!(cat.default_duration(&c.id).unwrap(), Some(10));

        cat.update(&c.id, "Outro".into(), Some(20));
        let got = cat.get(&c.id).unwrap();
        assert_eq!(got.title, "Outro");
        assert_eq!(got.default_duration, Some(20));

        assert!(cat.remove(&c.id).is_some());
        assert!(cat.is_empty());
        assert!(matches!(
            cat.default_duration(&c.id),
            Err(EngineError::ContentNotFound(_))
        ));
    }

    #[test]
    fn list_is_ordered_by_id() {
        let cat = ContentCatalog::new();
        for _ in 0..5 {
            cat.insert(video(None));
        }
        let ids: Vec<Ulid> = cat.list().iter().map(|c| c.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn validation() {
        assert!(validate_content(&video(Some(10))).is_ok());
        assert!(validate_content(&video(None)).is_ok());
        assert!(matches!(
            validate_content(&video(Some(0))),
            Err(EngineError::InvalidDuration(0))
        ));

        let mut c = video(None);
        c.title = "   ".into();
        assert!(matches!(validate_content(&c), Err(EngineError::InvalidContent(_))));

        let mut c = video(None);
        c.title = "x".repeat(MAX_TITLE_LEN + 1);
        assert!(matches!(validate_content(&c), Err(EngineError::LimitExceeded(_))));

        let mut c = video(None);
        c.kind = ContentKind::Text { text: String::new() };
        assert!(matches!(validate_content(&c), Err(EngineError::InvalidContent(_))));

        let mut c = video(None);
        c.kind = ContentKind::Banner {
            image_url: "b.png".into(),
            text: Some("y".repeat(MAX_BODY_LEN + 1)),
        };
        assert!(matches!(validate_content(&c), Err(EngineError::LimitExceeded(_))));
    }
}
