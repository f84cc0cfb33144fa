use super::{blank_nodes::SourceScope, Literal, StatementRecord, Syntax, Term};
use crate::error::ParseError;
use rio_api::{
    model::{GraphName, Literal as RioLiteral, NamedNode, Quad, Subject, Term as RioTerm, Triple},
    parser::{QuadsParser, TriplesParser},
};
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
    sync::mpsc::SyncSender,
};

fn named_node(node: NamedNode<'_>) -> Term {
    Term::Uri(node.iri.to_owned())
}

fn subject(subject: Subject<'_>, scope: &SourceScope) -> Result<Term, ParseError> {
    match subject {
        Subject::NamedNode(node) => Ok(named_node(node)),
        Subject::BlankNode(node) => Ok(Term::BlankNode(scope.label(node.id))),
        #[allow(unreachable_patterns)]
        _ => Err(ParseError::Unsupported("quoted triple in subject position")),
    }
}

fn object(object: RioTerm<'_>, scope: &SourceScope) -> Result<Term, ParseError> {
    match object {
        RioTerm::NamedNode(node) => Ok(named_node(node)),
        RioTerm::BlankNode(node) => Ok(Term::BlankNode(scope.label(node.id))),
        RioTerm::Literal(RioLiteral::Simple { value }) => Ok(Term::Literal(Literal::Simple(value.to_owned()))),
        RioTerm::Literal(RioLiteral::LanguageTaggedString { value, language }) => {
            Ok(Term::Literal(Literal::LanguageTagged { value: value.to_owned(), language: language.to_owned() }))
        },
        RioTerm::Literal(RioLiteral::Typed { value, datatype }) => {
            Ok(Term::Literal(Literal::Typed { value: value.to_owned(), datatype: datatype.iri.to_owned() }))
        },
        #[allow(unreachable_patterns)]
        _ => Err(ParseError::Unsupported("quoted triple in object position")),
    }
}

fn graph_name(graph: GraphName<'_>, scope: &SourceScope) -> Term {
    match graph {
        GraphName::NamedNode(node) => named_node(node),
        GraphName::BlankNode(node) => Term::BlankNode(scope.label(node.id)),
    }
}

pub fn convert_triple(triple: Triple<'_>, scope: &SourceScope) -> Result<StatementRecord, ParseError> {
    Ok(StatementRecord::triple(
        subject(triple.subject, scope)?,
        named_node(triple.predicate),
        object(triple.object, scope)?,
    ))
}

pub fn convert_quad(quad: Quad<'_>, scope: &SourceScope) -> Result<StatementRecord, ParseError> {
    Ok(StatementRecord {
        subject: subject(quad.subject, scope)?,
        predicate: named_node(quad.predicate),
        object: object(quad.object, scope)?,
        graph: quad.graph_name.map(|g| graph_name(g, scope)),
    })
}

/// Parse `reader` and hand each statement to `on_statement`, returning how many were read.
pub fn read_statements<R, F>(
    reader: R,
    syntax: Syntax,
    scope: &SourceScope,
    mut on_statement: F,
) -> Result<u64, ParseError>
where
    R: BufRead,
    F: FnMut(StatementRecord) -> Result<(), ParseError>,
{
    let mut count = 0;

    match syntax {
        Syntax::NTriples => rio_turtle::NTriplesParser::new(reader).parse_all(&mut |triple| {
            count += 1;
            on_statement(convert_triple(triple, scope)?)
        })?,
        Syntax::NQuads => rio_turtle::NQuadsParser::new(reader).parse_all(&mut |quad| {
            count += 1;
            on_statement(convert_quad(quad, scope)?)
        })?,
    }

    Ok(count)
}

pub fn read_statement_file<P, F>(path: P, scope: &SourceScope, on_statement: F) -> Result<u64, ParseError>
where
    P: AsRef<Path>,
    F: FnMut(StatementRecord) -> Result<(), ParseError>,
{
    let syntax = Syntax::from_path(path.as_ref());
    let reader = BufReader::new(File::open(path.as_ref())?);

    read_statements(reader, syntax, scope, on_statement)
}

/// Parse a file and send its statements down `tx`. Stops early when the receiver is gone.
pub fn send_statement_file<P: AsRef<Path>>(
    path: P,
    scope: &SourceScope,
    tx: &SyncSender<Result<StatementRecord, ParseError>>,
) -> Result<u64, ParseError> {
    read_statement_file(path, scope, |statement| tx.send(Ok(statement)).map_err(|_| ParseError::Disconnected))
}
