//! Binary payload extraction and reinsertion.
//!
//! Arguments may carry binary leaves anywhere inside nested sequences and
//! mappings. [`extract_blobs`] walks the tree depth-first and records one
//! [`BlobRef`] per binary leaf; the caller uploads what needs uploading and
//! writes the results back with [`update_at_path`] on the JSON skeleton
//! produced by [`PayloadValue::to_skeleton`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Component whose binary leaves are inlined as base64 instead of uploaded.
pub const IMAGE_COMPONENT: &str = "Image";

/// Component whose uploads are reinserted as the raw upload response.
pub const GALLERY_COMPONENT: &str = "Gallery";

/// A file-like binary object.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub data: Bytes,
    pub name: Option<String>,
    pub mime: Option<String>,
}

impl Blob {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            name: None,
            mime: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn mime_or_default(&self) -> &str {
        self.mime.as_deref().unwrap_or("application/octet-stream")
    }
}

/// One node of an argument tree.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<PayloadValue>),
    Object(BTreeMap<String, PayloadValue>),
    /// Raw bytes.
    Bytes(Bytes),
    /// A file-like object.
    Blob(Blob),
}

/// Shape of a node as seen by the walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeShape {
    Sequence,
    Mapping,
    BinaryLeaf,
    ScalarLeaf,
}

impl PayloadValue {
    pub fn shape(&self) -> NodeShape {
        match self {
            PayloadValue::Array(_) => NodeShape::Sequence,
            PayloadValue::Object(_) => NodeShape::Mapping,
            PayloadValue::Bytes(_) | PayloadValue::Blob(_) => NodeShape::BinaryLeaf,
            PayloadValue::Null
            | PayloadValue::Bool(_)
            | PayloadValue::Number(_)
            | PayloadValue::String(_) => NodeShape::ScalarLeaf,
        }
    }

    /// Follow `path` from this node.
    pub fn get_path(&self, path: &[PathSegment]) -> Option<&PayloadValue> {
        path.iter().try_fold(self, |node, segment| match (node, segment) {
            (PayloadValue::Array(items), PathSegment::Index(i)) => items.get(*i),
            (PayloadValue::Object(map), PathSegment::Key(k)) => map.get(k),
            _ => None,
        })
    }

    /// JSON copy of the tree with every binary leaf replaced by `null`.
    pub fn to_skeleton(&self) -> Value {
        match self {
            PayloadValue::Null | PayloadValue::Bytes(_) | PayloadValue::Blob(_) => Value::Null,
            PayloadValue::Bool(b) => Value::Bool(*b),
            PayloadValue::Number(n) => Value::Number(n.clone()),
            PayloadValue::String(s) => Value::String(s.clone()),
            PayloadValue::Array(items) => {
                Value::Array(items.iter().map(PayloadValue::to_skeleton).collect())
            }
            PayloadValue::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_skeleton()))
                    .collect::<Map<_, _>>(),
            ),
        }
    }
}

impl From<Value> for PayloadValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => PayloadValue::Null,
            Value::Bool(b) => PayloadValue::Bool(b),
            Value::Number(n) => PayloadValue::Number(n),
            Value::String(s) => PayloadValue::String(s),
            Value::Array(items) => {
                PayloadValue::Array(items.into_iter().map(PayloadValue::from).collect())
            }
            Value::Object(map) => PayloadValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, PayloadValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for PayloadValue {
    fn from(s: &str) -> Self {
        PayloadValue::String(s.to_string())
    }
}

impl From<Blob> for PayloadValue {
    fn from(blob: Blob) -> Self {
        PayloadValue::Blob(blob)
    }
}

impl From<Vec<u8>> for PayloadValue {
    fn from(bytes: Vec<u8>) -> Self {
        PayloadValue::Bytes(Bytes::from(bytes))
    }
}

/// One step of a path into an argument tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "[{i}]"),
            PathSegment::Key(k) => write!(f, ".{k}"),
        }
    }
}

/// What to do with an extracted leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum BlobContent {
    /// Upload the bytes and reinsert a file handle.
    Upload(Blob),
    /// Reinsert this base64 text directly.
    Inline(String),
}

/// A binary leaf located inside an argument tree.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobRef {
    pub path: Vec<PathSegment>,
    pub content: BlobContent,
    /// Component declared for the top-level argument the leaf sits under.
    pub component: Option<String>,
}

impl BlobRef {
    pub fn needs_upload(&self) -> bool {
        matches!(self.content, BlobContent::Upload(_))
    }
}

/// Runtime-specific binary handling.
pub trait BlobPlatform: Send + Sync {
    /// Inline representation of a file-like object headed for an image component.
    fn encode_image(&self, blob: &Blob) -> String;

    /// Turn raw bytes into an uploadable object.
    fn uploadable(&self, bytes: Bytes) -> Blob {
        Blob::new(bytes).with_name("blob")
    }
}

/// Plain base64 for image leaves, as a non-UI process would produce.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativePlatform;

impl BlobPlatform for NativePlatform {
    fn encode_image(&self, blob: &Blob) -> String {
        STANDARD.encode(&blob.data)
    }
}

/// `data:` URIs for image leaves, matching what a browser file reader yields.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataUriPlatform;

impl BlobPlatform for DataUriPlatform {
    fn encode_image(&self, blob: &Blob) -> String {
        format!(
            "data:{};base64,{}",
            blob.mime_or_default(),
            STANDARD.encode(&blob.data)
        )
    }
}

/// Collect a reference for every binary leaf under `args`.
///
/// The component declared for argument `i` applies to everything nested in
/// sequences under it; mapping values are walked without a component.
pub fn extract_blobs(
    args: &[PayloadValue],
    components: &dyn Fn(usize) -> Option<String>,
    platform: &dyn BlobPlatform,
) -> Vec<BlobRef> {
    let mut refs = Vec::new();
    for (i, arg) in args.iter().enumerate() {
        walk(
            arg,
            components(i).as_deref(),
            &mut vec![PathSegment::Index(i)],
            platform,
            &mut refs,
        );
    }
    refs
}

fn walk(
    node: &PayloadValue,
    component: Option<&str>,
    path: &mut Vec<PathSegment>,
    platform: &dyn BlobPlatform,
    refs: &mut Vec<BlobRef>,
) {
    match node {
        PayloadValue::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                path.push(PathSegment::Index(i));
                walk(item, component, path, platform, refs);
                path.pop();
            }
        }
        PayloadValue::Object(map) => {
            for (key, value) in map {
                path.push(PathSegment::Key(key.clone()));
                walk(value, None, path, platform, refs);
                path.pop();
            }
        }
        PayloadValue::Bytes(bytes) => {
            let content = if component == Some(IMAGE_COMPONENT) {
                BlobContent::Inline(STANDARD.encode(bytes))
            } else {
                BlobContent::Upload(platform.uploadable(bytes.clone()))
            };
            refs.push(BlobRef {
                path: path.clone(),
                content,
                component: component.map(str::to_string),
            });
        }
        PayloadValue::Blob(blob) => {
            let content = if component == Some(IMAGE_COMPONENT) {
                BlobContent::Inline(platform.encode_image(blob))
            } else {
                BlobContent::Upload(blob.clone())
            };
            refs.push(BlobRef {
                path: path.clone(),
                content,
                component: component.map(str::to_string),
            });
        }
        PayloadValue::Null
        | PayloadValue::Bool(_)
        | PayloadValue::Number(_)
        | PayloadValue::String(_) => {}
    }
}

/// File-handle object reinserted in place of an uploaded leaf.
pub fn file_handle(name: &str) -> Value {
    serde_json::json!({ "is_file": true, "name": name, "data": null })
}

/// Replacement for a reference given the server's handle for its upload.
pub fn uploaded_replacement(blob_ref: &BlobRef, handle: Value) -> Value {
    if blob_ref.component.as_deref() == Some(GALLERY_COMPONENT) {
        return handle;
    }
    let name = match &handle {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    file_handle(&name)
}

/// Write `value` into `root` at `path`.
///
/// Walks the first N-1 segments and assigns through the last one. Returns
/// `false` if the path does not exist in `root`.
pub fn update_at_path(root: &mut Value, path: &[PathSegment], value: Value) -> bool {
    let Some((last, parents)) = path.split_last() else {
        *root = value;
        return true;
    };

    let mut node = root;
    for segment in parents {
        let next = match (node, segment) {
            (Value::Array(items), PathSegment::Index(i)) => items.get_mut(*i),
            (Value::Object(map), PathSegment::Key(k)) => map.get_mut(k),
            _ => None,
        };
        match next {
            Some(child) => node = child,
            None => return false,
        }
    }

    match (node, last) {
        (Value::Array(items), PathSegment::Index(i)) => match items.get_mut(*i) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        },
        (Value::Object(map), PathSegment::Key(k)) => {
            map.insert(k.clone(), value);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn no_components(_: usize) -> Option<String> {
        None
    }

    #[test]
    fn test_scalar_tree_yields_no_refs() {
        let args: Vec<PayloadValue> = vec![json!("a").into(), json!({"k": [1, 2, null]}).into()];
        let refs = extract_blobs(&args, &no_components, &NativePlatform);
        assert!(refs.is_empty());
    }

    #[test]
    fn test_nested_paths_and_order() {
        let mut inner = BTreeMap::new();
        inner.insert("file".to_string(), PayloadValue::Blob(Blob::new(vec![1u8])));
        let args = vec![
            PayloadValue::Array(vec![
                PayloadValue::String("x".into()),
                PayloadValue::Bytes(Bytes::from_static(b"ab")),
            ]),
            PayloadValue::Object(inner),
        ];
        let refs = extract_blobs(&args, &no_components, &NativePlatform);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].path, vec![PathSegment::Index(0), PathSegment::Index(1)]);
        assert_eq!(
            refs[1].path,
            vec![PathSegment::Index(1), PathSegment::Key("file".into())]
        );
        assert!(refs.iter().all(BlobRef::needs_upload));
        for r in &refs {
            let wrapped = PayloadValue::Array(args.clone());
            assert_eq!(wrapped.get_path(&r.path).unwrap().shape(), NodeShape::BinaryLeaf);
        }
    }

    #[test]
    fn test_image_bytes_inlined_as_base64() {
        let args = vec![PayloadValue::Bytes(Bytes::from_static(b"hi"))];
        let components = |i: usize| (i == 0).then(|| IMAGE_COMPONENT.to_string());
        let refs = extract_blobs(&args, &components, &NativePlatform);
        assert_eq!(refs[0].content, BlobContent::Inline("aGk=".into()));
        assert_eq!(refs[0].component.as_deref(), Some(IMAGE_COMPONENT));
    }

    #[test]
    fn test_image_blob_uses_platform_encoding() {
        let blob = Blob::new(vec![104u8, 105]).with_mime("image/png");
        let args = vec![PayloadValue::Array(vec![PayloadValue::Blob(blob)])];
        let components = |_: usize| Some(IMAGE_COMPONENT.to_string());
        let refs = extract_blobs(&args, &components, &DataUriPlatform);
        assert_eq!(
            refs[0].content,
            BlobContent::Inline("data:image/png;base64,aGk=".into())
        );
    }

    #[test]
    fn test_mapping_children_lose_component() {
        let mut map = BTreeMap::new();
        map.insert("img".to_string(), PayloadValue::Bytes(Bytes::from_static(b"x")));
        let args = vec![PayloadValue::Object(map)];
        let components = |_: usize| Some(IMAGE_COMPONENT.to_string());
        let refs = extract_blobs(&args, &components, &NativePlatform);
        assert!(refs[0].needs_upload());
        assert_eq!(refs[0].component, None);
    }

    #[test]
    fn test_update_at_path_nested() {
        let mut root = json!([{"a": [0, null]}]);
        let path = vec![
            PathSegment::Index(0),
            PathSegment::Key("a".into()),
            PathSegment::Index(1),
        ];
        assert!(update_at_path(&mut root, &path, file_handle("/tmp/f")));
        assert_eq!(
            root,
            json!([{"a": [0, {"is_file": true, "name": "/tmp/f", "data": null}]}])
        );
    }

    #[test]
    fn test_update_at_missing_path() {
        let mut root = json!([1]);
        assert!(!update_at_path(&mut root, &[PathSegment::Index(4)], json!(2)));
        assert!(!update_at_path(
            &mut root,
            &[PathSegment::Key("x".into()), PathSegment::Index(0)],
            json!(2)
        ));
        assert_eq!(root, json!([1]));
    }

    #[test]
    fn test_gallery_gets_raw_handle() {
        let gallery = BlobRef {
            path: vec![PathSegment::Index(0)],
            content: BlobContent::Upload(Blob::new(vec![0u8])),
            component: Some(GALLERY_COMPONENT.into()),
        };
        assert_eq!(uploaded_replacement(&gallery, json!("/tmp/a.png")), json!("/tmp/a.png"));

        let file = BlobRef {
            component: Some("File".into()),
            ..gallery
        };
        assert_eq!(
            uploaded_replacement(&file, json!("/tmp/a.png")),
            file_handle("/tmp/a.png")
        );
    }

    #[test]
    fn test_skeleton_nulls_binary() {
        let args = PayloadValue::Array(vec![
            PayloadValue::from("t"),
            PayloadValue::from(vec![1u8, 2]),
        ]);
        assert_eq!(args.to_skeleton(), json!(["t", null]));
    }
}
