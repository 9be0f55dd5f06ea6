//! One-shot libclang parse of a single file.
//!
//! The walk visits every cursor whose expansion location lies in the primary
//! file and produces two maps: exported definitions (USR → location) and
//! cross-translation-unit references ((USR, defining file) → use sites).
//! Sub-cursors of macro expansions share the expansion's source coordinates
//! and are filtered out so a macro use is counted once.
//!
//! libclang indexes are not shared: each worker thread lazily creates its
//! own and re-uses it for every file that thread parses.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use clang::diagnostic::Severity;
use clang::{Clang, Entity, EntityKind, EntityVisitResult, Index, Linkage};
use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::{Result, SymdbError};
use crate::schema::{LineCol, Location};

/// USR → definition location within the parsed file.
pub type DefinedSymbolMap = BTreeMap<String, Location>;

/// (referenced USR, absolute path of the defining file) → use sites in the
/// parsed file.
pub type ReferencedSymbolMap = BTreeMap<(String, String), BTreeSet<LineCol>>;

/// Owned result of one parse; moves freely between threads.
#[derive(Debug, Default, Clone)]
pub struct ParsedUnit {
    pub defined: DefinedSymbolMap,
    pub referenced: ReferencedSymbolMap,
}

thread_local! {
    static THREAD_CLANG: OnceCell<&'static Clang> = const { OnceCell::new() };
    static THREAD_INDEX: OnceCell<Index<'static>> = const { OnceCell::new() };
}

/// Parses `abs_path` with the given argument vector and collects symbols.
pub fn parse_file(abs_path: &Path, arguments: &[String]) -> Result<ParsedUnit> {
    THREAD_CLANG.with(|cell| -> Result<ParsedUnit> {
        let clang: &'static Clang = *cell.get_or_try_init(|| {
            Clang::new()
                .map(|c| &*Box::leak(Box::new(c)))
                .map_err(|e| SymdbError::ParseFailed {
                    message: format!("libclang init: {e}"),
                })
        })?;
    THREAD_INDEX.with(|cell| {
        let index = cell.get_or_init(|| Index::new(clang, false, false));
        let tu = index
            .parser(abs_path)
            .arguments(arguments)
            .detailed_preprocessing_record(true)
            .parse()
            .map_err(|e| SymdbError::ParseFailed {
                message: format!("{}: {e}", abs_path.display()),
            })?;

        for diagnostic in tu
            .get_diagnostics()
            .iter()
            .filter(|d| d.get_severity() >= Severity::Error)
            .take(3)
        {
            warn!(file = %abs_path.display(), diagnostic = %diagnostic.get_text(), "clang diagnostic");
        }

        Ok(collect_symbols(tu.get_entity(), abs_path))
    })
    })
}

fn collect_symbols(root: Entity, primary: &Path) -> ParsedUnit {
    let mut unit = ParsedUnit::default();
    let mut macro_spots: HashSet<LineCol> = HashSet::new();
    let primary: PathBuf = primary.to_path_buf();
    let primary_str = primary.to_string_lossy().into_owned();

    root.visit_children(|entity, _parent| {
        let Some(source_loc) = entity.get_location() else {
            return EntityVisitResult::Continue;
        };
        let expansion = source_loc.get_expansion_location();
        let in_primary = expansion
            .file
            .as_ref()
            .map(|f| f.get_path() == primary)
            .unwrap_or(false);

        if in_primary {
            let line_col: LineCol = (expansion.line, expansion.column);
            if entity.get_kind() == EntityKind::MacroExpansion {
                macro_spots.insert(line_col);
            } else if !macro_spots.contains(&line_col) {
                if entity.is_definition() && is_wanted_definition(&entity) {
                    record_definition(&entity, &primary_str, line_col, &mut unit.defined);
                } else if is_wanted_reference_site(&entity) {
                    record_reference(&entity, line_col, &mut unit.referenced);
                }
            }
        }

        if should_recurse(&entity) {
            EntityVisitResult::Recurse
        } else {
            EntityVisitResult::Continue
        }
    });

    unit
}

fn record_definition(
    entity: &Entity,
    primary: &str,
    (line, column): LineCol,
    defined: &mut DefinedSymbolMap,
) {
    let Some(name) = entity.get_name().filter(|n| !n.is_empty()) else {
        return;
    };
    match entity.get_usr().filter(|u| !u.0.is_empty()) {
        Some(usr) => {
            defined.insert(usr.0, Location::new(primary, line, column));
        }
        None => debug!(symbol = %name, line, column, "definition without USR"),
    }
}

fn record_reference(entity: &Entity, line_col: LineCol, referenced: &mut ReferencedSymbolMap) {
    let Some(target) = entity.get_reference() else {
        return;
    };
    if !is_wanted_reference_target(&target) {
        return;
    }
    let Some(usr) = target.get_usr().filter(|u| !u.0.is_empty()) else {
        return;
    };
    let Some(target_file) = target
        .get_location()
        .and_then(|l| l.get_expansion_location().file)
    else {
        return;
    };
    referenced
        .entry((usr.0, target_file.get_path().to_string_lossy().into_owned()))
        .or_default()
        .insert(line_col);
}

fn has_external_linkage(entity: &Entity) -> bool {
    matches!(
        entity.get_linkage(),
        Some(Linkage::External) | Some(Linkage::UniqueExternal)
    )
}

/// Methods and constructors are always exported; the remaining declaration
/// kinds only when their linkage is visible outside the translation unit.
fn is_wanted_definition(entity: &Entity) -> bool {
    match entity.get_kind() {
        EntityKind::Method | EntityKind::Constructor => true,
        EntityKind::StructDecl
        | EntityKind::ClassDecl
        | EntityKind::TypedefDecl
        | EntityKind::TypeAliasDecl
        | EntityKind::FunctionTemplate
        | EntityKind::ClassTemplate
        | EntityKind::FunctionDecl
        | EntityKind::VarDecl => has_external_linkage(entity),
        _ => false,
    }
}

fn is_wanted_reference_site(entity: &Entity) -> bool {
    let wanted = match entity.get_kind() {
        EntityKind::TypeRef
        | EntityKind::MemberRef
        | EntityKind::MemberRefExpr
        | EntityKind::TemplateRef => true,
        EntityKind::DeclRefExpr => entity
            .get_reference()
            .map(|t| has_external_linkage(&t))
            .unwrap_or(false),
        _ => false,
    };
    if !wanted {
        return false;
    }
    entity
        .get_name()
        .map(|n| !n.contains("operator"))
        .unwrap_or(false)
}

fn is_wanted_reference_target(target: &Entity) -> bool {
    let wanted = match target.get_kind() {
        EntityKind::Method | EntityKind::Constructor | EntityKind::FunctionDecl => true,
        EntityKind::VarDecl
        | EntityKind::EnumConstantDecl
        | EntityKind::StructDecl
        | EntityKind::ClassDecl
        | EntityKind::TypedefDecl
        | EntityKind::TypeAliasDecl
        | EntityKind::FunctionTemplate
        | EntityKind::ClassTemplate => target.get_linkage() == Some(Linkage::External),
        _ => false,
    };
    wanted || in_std_or_boost(target)
}

/// True when the enclosing namespace chain names `std` or `boost`.
fn in_std_or_boost(entity: &Entity) -> bool {
    let mut current = entity.get_semantic_parent();
    while let Some(parent) = current {
        match parent.get_kind() {
            EntityKind::TranslationUnit => return false,
            EntityKind::Namespace => {
                if let Some(name) = parent.get_name() {
                    if name == "std" || name == "boost" {
                        return true;
                    }
                }
            }
            _ => {}
        }
        current = parent.get_semantic_parent();
    }
    false
}

/// Descend where symbols can hide; skip the rest of the tree.
fn should_recurse(entity: &Entity) -> bool {
    match entity.get_kind() {
        EntityKind::Namespace
        | EntityKind::ClassDecl
        | EntityKind::StructDecl
        | EntityKind::ClassTemplate
        | EntityKind::ClassTemplatePartialSpecialization
        | EntityKind::FunctionDecl
        | EntityKind::Method
        | EntityKind::Constructor
        | EntityKind::Destructor
        | EntityKind::FunctionTemplate
        | EntityKind::VarDecl
        | EntityKind::CallExpr => true,
        _ => entity.is_statement() || entity.is_expression(),
    }
}
