//! Compiler CFG dump parsing and the in-memory control-flow-graph model.
//!
//! The dump is the only authoritative source of CFG topology. The parser
//! recognizes exactly these markers, in the style of GCC GIMPLE dumps with
//! line-number annotations:
//!
//! ```text
//! ;; Function tree_ssa_stack_protect (tree_ssa_stack_protect, funcdef_no=12, ...)
//! <bb 2>:
//! [tree-ssa.c:102:5] guard = init_guard ();
//! ;; 2 succs { 3 4 }
//! ```
//!
//! Blocks are arena-allocated by integer id; successors and predecessors are
//! id lists, never references, so back-edges cost nothing.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use tracing::debug;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CfgError {
    #[error("line {line_no}: basic block outside a function section")]
    BlockOutsideFunction { line_no: usize },
    #[error("line {line_no}: successor list outside a basic block")]
    SuccsOutsideBlock { line_no: usize },
    #[error("line {line_no}: malformed basic-block id")]
    BadBlockId { line_no: usize },
    #[error("line {line_no}: malformed successor list")]
    BadSuccList { line_no: usize },
    #[error("function `{function}`: successor references unknown block {bb}")]
    UnknownSuccessor { function: String, bb: u32 },
    #[error("function `{function}`: entry block {entry} has predecessors")]
    EntryHasPredecessors { function: String, entry: u32 },
    #[error("dump contains no function sections")]
    Empty,
}

/// One basic block plus the selector's attempt bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    pub id: u32,
    pub source_file: Option<PathBuf>,
    pub lines: BTreeSet<u32>,
    pub succs: Vec<u32>,
    pub preds: Vec<u32>,
    /// Unsuccessful targeting attempts since the last success.
    pub attempts: u32,
    pub successes: u32,
}

impl BasicBlock {
    fn new(id: u32) -> Self {
        Self {
            id,
            source_file: None,
            lines: BTreeSet::new(),
            succs: Vec::new(),
            preds: Vec::new(),
            attempts: 0,
            successes: 0,
        }
    }

    /// Blocks without source lines stay in the graph for topology but are
    /// never targeted.
    pub fn is_targetable(&self) -> bool {
        !self.lines.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCfg {
    pub name: String,
    pub entry: u32,
    pub blocks: BTreeMap<u32, BasicBlock>,
}

impl FunctionCfg {
    pub fn block(&self, id: u32) -> Option<&BasicBlock> {
        self.blocks.get(&id)
    }
}

/// All functions of one dump, in dump order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cfg {
    pub functions: IndexMap<String, FunctionCfg>,
}

impl Cfg {
    pub fn function(&self, name: &str) -> Option<&FunctionCfg> {
        self.functions.get(name)
    }

    /// Parses a dump, canonicalizing relative source paths against
    /// `source_root`.
    pub fn parse(dump: &str, source_root: &Path) -> Result<Self, CfgError> {
        let mut parser = Parser::new(source_root);
        for (index, line) in dump.lines().enumerate() {
            parser.feed(index + 1, line)?;
        }
        parser.finish()
    }
}

struct Parser<'a> {
    source_root: &'a Path,
    functions: IndexMap<String, FunctionCfg>,
    current_function: Option<String>,
    current_block: Option<u32>,
}

impl<'a> Parser<'a> {
    fn new(source_root: &'a Path) -> Self {
        Self {
            source_root,
            functions: IndexMap::new(),
            current_function: None,
            current_block: None,
        }
    }

    fn feed(&mut self, line_no: usize, line: &str) -> Result<(), CfgError> {
        let trimmed = line.trim();

        if let Some(rest) = trimmed.strip_prefix(";; Function ") {
            let name = rest
                .split(|c: char| c == ' ' || c == '(')
                .next()
                .unwrap_or(rest)
                .to_owned();
            self.functions.insert(
                name.clone(),
                FunctionCfg {
                    name: name.clone(),
                    entry: 0,
                    blocks: BTreeMap::new(),
                },
            );
            self.current_function = Some(name);
            self.current_block = None;
            return Ok(());
        }

        if let Some(rest) = trimmed.strip_prefix("<bb ") {
            let id_text = rest
                .split(|c: char| c == '>' || c == ' ')
                .next()
                .ok_or(CfgError::BadBlockId { line_no })?;
            let id: u32 = id_text
                .parse()
                .map_err(|_| CfgError::BadBlockId { line_no })?;

            let function = self
                .current_function
                .as_ref()
                .ok_or(CfgError::BlockOutsideFunction { line_no })?;
            let function = &mut self.functions[function];
            if function.blocks.is_empty() {
                function.entry = id;
            }
            function.blocks.entry(id).or_insert_with(|| BasicBlock::new(id));
            self.current_block = Some(id);
            return Ok(());
        }

        if trimmed.starts_with(";; ") && trimmed.contains("succs {") {
            let succs = parse_succ_list(trimmed).ok_or(CfgError::BadSuccList { line_no })?;
            let block = self
                .current_block
                .ok_or(CfgError::SuccsOutsideBlock { line_no })?;
            let function = self
                .current_function
                .as_ref()
                .ok_or(CfgError::SuccsOutsideBlock { line_no })?;
            let block = self.functions[function]
                .blocks
                .get_mut(&block)
                .unwrap_or_else(|| unreachable!("current block was inserted on <bb> marker"));
            block.succs = succs;
            return Ok(());
        }

        // Any other line inside a block may carry a `[path:line:col]` prefix.
        if let (Some(function), Some(block_id)) = (&self.current_function, self.current_block)
            && let Some((file, source_line)) = parse_location(trimmed)
        {
            let block = self.functions[function]
                .blocks
                .get_mut(&block_id)
                .unwrap_or_else(|| unreachable!("current block was inserted on <bb> marker"));
            let path = if file.is_absolute() {
                file
            } else {
                self.source_root.join(file)
            };
            block.source_file.get_or_insert(path);
            block.lines.insert(source_line);
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Cfg, CfgError> {
        if self.functions.is_empty() {
            return Err(CfgError::Empty);
        }

        for function in self.functions.values_mut() {
            // Successor lists are authoritative; predecessors are derived by
            // inversion once the forward parse is complete.
            let edges: Vec<(u32, u32)> = function
                .blocks
                .values()
                .flat_map(|block| block.succs.iter().map(move |&succ| (block.id, succ)))
                .collect();
            for (from, to) in edges {
                let Some(target) = function.blocks.get_mut(&to) else {
                    return Err(CfgError::UnknownSuccessor {
                        function: function.name.clone(),
                        bb: to,
                    });
                };
                target.preds.push(from);
            }
            for block in function.blocks.values_mut() {
                block.preds.sort_unstable();
                block.preds.dedup();
            }
            let entry = function.entry;
            if function
                .blocks
                .get(&entry)
                .is_some_and(|block| !block.preds.is_empty())
            {
                return Err(CfgError::EntryHasPredecessors {
                    function: function.name.clone(),
                    entry,
                });
            }
            debug!(
                function = function.name,
                blocks = function.blocks.len(),
                "Parsed function CFG"
            );
        }
        Ok(Cfg {
            functions: self.functions,
        })
    }
}

/// Parses `;; N succs { A B ... }`. `ENTRY`/`EXIT` pseudo tokens are dropped:
/// they never materialize as blocks.
fn parse_succ_list(line: &str) -> Option<Vec<u32>> {
    let open = line.find('{')?;
    let close = line.rfind('}')?;
    let body = line.get(open + 1..close)?;
    let mut succs = Vec::new();
    for token in body.split_whitespace() {
        if token == "ENTRY" || token == "EXIT" {
            continue;
        }
        succs.push(token.parse().ok()?);
    }
    Some(succs)
}

/// Extracts a leading `[path:line:col]` location annotation.
fn parse_location(line: &str) -> Option<(PathBuf, u32)> {
    let rest = line.strip_prefix('[')?;
    let inner = &rest[..rest.find(']')?];
    // Split from the right: paths may contain colons is not a case we accept,
    // but line and column are always the last two fields.
    let (rest, _col) = inner.rsplit_once(':')?;
    let (path, line) = rest.rsplit_once(':')?;
    if path.is_empty() {
        return None;
    }
    Some((PathBuf::from(path), line.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "\
;; Function stack_protect_prologue (stack_protect_prologue, funcdef_no=7)

<bb 2>:
[guard.c:10:3] decl = current_function_decl;
[guard.c:11:3] if (flag_stack_protect == 0)
;; 2 succs { 3 4 }

<bb 3>:
[guard.c:14:5] create_guard (decl);
;; 1 succs { 4 }

<bb 4>:
;; 1 succs { EXIT }

;; Function expand_fortify_check (expand_fortify_check, funcdef_no=9)

<bb 2>:
[fortify.c:40:3] len = object_size (ref);
;; 1 succs { EXIT }
";

    fn parsed() -> Cfg {
        Cfg::parse(DUMP, Path::new("/src")).unwrap()
    }

    #[test]
    fn parses_functions_and_blocks() {
        let cfg = parsed();
        assert_eq!(cfg.functions.len(), 2);

        let f = cfg.function("stack_protect_prologue").unwrap();
        assert_eq!(f.entry, 2);
        assert_eq!(f.blocks.len(), 3);
        assert_eq!(f.block(2).unwrap().succs, vec![3, 4]);
        assert_eq!(
            f.block(2).unwrap().lines.iter().copied().collect::<Vec<_>>(),
            vec![10, 11]
        );
        assert_eq!(
            f.block(2).unwrap().source_file.as_deref(),
            Some(Path::new("/src/guard.c"))
        );
    }

    #[test]
    fn predecessors_are_inverted_successors() {
        let cfg = parsed();
        let f = cfg.function("stack_protect_prologue").unwrap();
        assert!(f.block(2).unwrap().preds.is_empty());
        assert_eq!(f.block(3).unwrap().preds, vec![2]);
        assert_eq!(f.block(4).unwrap().preds, vec![2, 3]);
    }

    #[test]
    fn exit_pseudo_blocks_are_dropped() {
        let cfg = parsed();
        let f = cfg.function("stack_protect_prologue").unwrap();
        assert!(f.block(4).unwrap().succs.is_empty());
    }

    #[test]
    fn lineless_blocks_are_kept_but_not_targetable() {
        let cfg = parsed();
        let f = cfg.function("stack_protect_prologue").unwrap();
        assert!(!f.block(4).unwrap().is_targetable());
        assert!(f.block(3).unwrap().is_targetable());
    }

    #[test]
    fn parse_errors_are_fatal() {
        assert_eq!(
            Cfg::parse("<bb 2>:\n", Path::new("/src")).unwrap_err(),
            CfgError::BlockOutsideFunction { line_no: 1 }
        );
        assert_eq!(
            Cfg::parse(
                ";; Function f (f)\n;; 1 succs { 3 }\n",
                Path::new("/src")
            )
            .unwrap_err(),
            CfgError::SuccsOutsideBlock { line_no: 2 }
        );
        assert_eq!(
            Cfg::parse(
                ";; Function f (f)\n<bb 2>:\n;; 1 succs { 9 }\n",
                Path::new("/src")
            )
            .unwrap_err(),
            CfgError::UnknownSuccessor {
                function: "f".to_owned(),
                bb: 9
            }
        );
        assert_eq!(
            Cfg::parse("", Path::new("/src")).unwrap_err(),
            CfgError::Empty
        );
    }

    #[test]
    fn relative_paths_are_joined_with_source_root() {
        let cfg = Cfg::parse(
            ";; Function f (f)\n<bb 2>:\n[sub/t.c:3:1] x = 1;\n;; 1 succs { EXIT }\n",
            Path::new("/work/src"),
        )
        .unwrap();
        let block = cfg.function("f").unwrap().block(2).unwrap();
        assert_eq!(block.source_file.as_deref(), Some(Path::new("/work/src/sub/t.c")));
    }
}
