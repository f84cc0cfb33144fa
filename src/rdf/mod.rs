use std::{fmt, path::Path};

pub mod blank_nodes;
pub mod codec;
pub mod parser;

pub const NTRIPLES_FILE_EXTENSION: &str = "nt";
pub const NQUADS_FILE_EXTENSION: &str = "nq";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Literal {
    Simple(String),
    LanguageTagged { value: String, language: String },
    Typed { value: String, datatype: String },
}

impl Literal {
    pub fn lexical_form(&self) -> &str {
        match self {
            Literal::Simple(value) | Literal::LanguageTagged { value, .. } | Literal::Typed { value, .. } => value,
        }
    }

    pub fn language(&self) -> Option<&str> {
        match self {
            Literal::LanguageTagged { language, .. } => Some(language),
            _ => None,
        }
    }

    pub fn datatype(&self) -> Option<&str> {
        match self {
            Literal::Typed { datatype, .. } => Some(datatype),
            _ => None,
        }
    }
}

/// An RDF term. A literal carries at most one of datatype or language tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Term {
    Uri(String),
    BlankNode(String),
    Literal(Literal),
    Variable(String),
}

impl Term {
    pub fn uri(iri: impl Into<String>) -> Self {
        Term::Uri(iri.into())
    }

    pub fn blank(label: impl Into<String>) -> Self {
        Term::BlankNode(label.into())
    }

    pub fn literal(value: impl Into<String>) -> Self {
        Term::Literal(Literal::Simple(value.into()))
    }

    pub fn lang_literal(value: impl Into<String>, language: impl Into<String>) -> Self {
        Term::Literal(Literal::LanguageTagged { value: value.into(), language: language.into() })
    }

    pub fn typed_literal(value: impl Into<String>, datatype: impl Into<String>) -> Self {
        Term::Literal(Literal::Typed { value: value.into(), datatype: datatype.into() })
    }

    pub fn variable(name: impl Into<String>) -> Self {
        Term::Variable(name.into())
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&codec::encode_to_string(self))
    }
}

/// Identifier of a distinct term within one build: the offset of its encoding in the object file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TermId(pub u64);

impl TermId {
    pub const WIDTH: usize = std::mem::size_of::<u64>();

    pub fn to_be_bytes(self) -> [u8; Self::WIDTH] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; Self::WIDTH]) -> Self {
        TermId(u64::from_be_bytes(bytes))
    }

    pub fn from_be_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self::from_be_bytes)
    }
}

impl fmt::Display for TermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One parsed triple (no graph) or quad.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementRecord {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
    pub graph: Option<Term>,
}

impl StatementRecord {
    pub fn triple(subject: Term, predicate: Term, object: Term) -> Self {
        Self { subject, predicate, object, graph: None }
    }

    pub fn quad(graph: Term, subject: Term, predicate: Term, object: Term) -> Self {
        Self { subject, predicate, object, graph: Some(graph) }
    }
}

/// A statement rewritten in term ids. Quads are ordered graph, subject, predicate, object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CodedTuple {
    Triple([TermId; 3]),
    Quad([TermId; 4]),
}

impl CodedTuple {
    pub fn arity(&self) -> usize {
        match self {
            CodedTuple::Triple(_) => 3,
            CodedTuple::Quad(_) => 4,
        }
    }

    pub fn ids(&self) -> &[TermId] {
        match self {
            CodedTuple::Triple(ids) => ids,
            CodedTuple::Quad(ids) => ids,
        }
    }

    pub fn graph(&self) -> Option<TermId> {
        match self {
            CodedTuple::Triple(_) => None,
            CodedTuple::Quad([g, ..]) => Some(*g),
        }
    }

    pub fn spo(&self) -> [TermId; 3] {
        match *self {
            CodedTuple::Triple(spo) => spo,
            CodedTuple::Quad([_, s, p, o]) => [s, p, o],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    NTriples,
    NQuads,
}

impl Syntax {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        match path.as_ref().extension() {
            Some(ext) if ext == NQUADS_FILE_EXTENSION => Syntax::NQuads,
            _ => Syntax::NTriples,
        }
    }
}

/// All n-triples/n-quads files below `path`, in path order. A plain file is yielded as is.
pub fn input_file_iter<P: AsRef<Path>>(path: P) -> impl Iterator<Item = walkdir::Result<walkdir::DirEntry>> {
    let is_rdf_file = |dir_entry: &walkdir::DirEntry| {
        !dir_entry.file_type().is_file()
            || matches!(
                dir_entry.path().extension(),
                Some(ext) if ext == NTRIPLES_FILE_EXTENSION || ext == NQUADS_FILE_EXTENSION
            )
    };

    let root_is_file = path.as_ref().is_file();

    walkdir::WalkDir::new(path)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| root_is_file || is_rdf_file(entry))
        .filter(|entry| !matches!(entry, Ok(entry) if entry.file_type().is_dir()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coded_tuple_arity() {
        let t = CodedTuple::Triple([TermId(1), TermId(2), TermId(3)]);
        let q = CodedTuple::Quad([TermId(9), TermId(1), TermId(2), TermId(3)]);

        assert_eq!(t.arity(), 3);
        assert_eq!(q.arity(), 4);
        assert_eq!(t.graph(), None);
        assert_eq!(q.graph(), Some(TermId(9)));
        assert_eq!(t.spo(), q.spo());
    }

    #[test]
    fn syntax_is_chosen_by_extension() {
        assert_eq!(Syntax::from_path("data/a.nq"), Syntax::NQuads);
        assert_eq!(Syntax::from_path("data/a.nt"), Syntax::NTriples);
        assert_eq!(Syntax::from_path("data/a"), Syntax::NTriples);
    }

    #[test]
    fn input_files_are_discovered_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.nt"), "").unwrap();
        std::fs::write(dir.path().join("a.nq"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        std::fs::write(dir.path().join("sub").join("c.nt"), "").unwrap();

        let found: Vec<_> = input_file_iter(dir.path())
            .map(|e| e.unwrap().path().strip_prefix(dir.path()).unwrap().to_owned())
            .collect();

        assert_eq!(found, vec![Path::new("a.nq"), Path::new("b.nt"), Path::new("sub/c.nt")]);
    }
}
