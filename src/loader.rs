use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{anyhow, bail, Context, Result};
use rhai::{Engine, EvalAltResult, Module, ModuleResolver, Position, Scope, Shared, AST};

use crate::config::RuntimeConfig;

pub const SCRIPT_EXTENSION: &str = "rhai";

/// Compiled script table with one designated entry script.
#[derive(Clone)]
pub struct CompiledScripts {
    scripts: Rc<BTreeMap<String, AST>>,
    mainfile: String,
    functions: Rc<BTreeMap<String, AST>>,
}

impl CompiledScripts {
    pub fn mainfile(&self) -> &str {
        &self.mainfile
    }

    pub fn main_ast(&self) -> &AST {
        &self.scripts[&self.mainfile]
    }

    pub fn get(&self, name: &str) -> Option<&AST> {
        self.scripts.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.scripts.keys()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// Function library of the entry script: every script's definitions, the entry script's
    /// taking precedence. Ad-hoc callables are resolved against it.
    pub fn functions(&self) -> &AST {
        &self.functions[&self.mainfile]
    }

    /// Function library seen by code from `script`: its own definitions win, then the entry
    /// script's, then the rest. Unknown or missing scripts fall back to the entry library.
    pub fn functions_for(&self, script: Option<&str>) -> &AST {
        script.and_then(|name| self.functions.get(name)).unwrap_or_else(|| self.functions())
    }

    pub(crate) fn resolver(&self) -> ScriptTableResolver {
        ScriptTableResolver { scripts: self.scripts.clone(), cache: RefCell::new(HashMap::new()) }
    }
}

pub struct ScriptLoader {
    engine: Engine,
    sources: BTreeMap<String, String>,
    mainfile: Option<String>,
}

impl ScriptLoader {
    pub fn new(config: &RuntimeConfig) -> Self {
        let mut engine = Engine::new();
        engine.set_max_expr_depths(config.max_expr_depth, config.max_expr_depth);
        Self { engine, sources: BTreeMap::new(), mainfile: None }
    }

    pub fn add_source(&mut self, name: impl Into<String>, source: impl Into<String>) -> &mut Self {
        self.sources.insert(name.into(), source.into());
        self
    }

    pub fn add_file(&mut self, name: impl Into<String>, path: impl AsRef<Path>) -> Result<&mut Self> {
        let path = path.as_ref();
        let source =
            fs::read_to_string(path).with_context(|| format!("Reading script {}", path.display()))?;
        Ok(self.add_source(name, source))
    }

    /// Adds every `.rhai` file below `dir`, named by its relative path without extension.
    pub fn add_directory(&mut self, dir: impl AsRef<Path>) -> Result<usize> {
        let root = dir.as_ref();
        let mut files = Vec::new();
        collect_scripts(root, &mut files)?;
        for path in &files {
            let relative = path.strip_prefix(root).with_context(|| format!("Resolving {}", path.display()))?;
            let name = script_name(relative);
            self.add_file(name, path)?;
        }
        Ok(files.len())
    }

    pub fn set_mainfile(&mut self, name: impl Into<String>) -> &mut Self {
        self.mainfile = Some(name.into());
        self
    }

    pub fn compile(&self) -> Result<CompiledScripts> {
        let mainfile = self.mainfile.clone().ok_or_else(|| anyhow!("No mainfile designated"))?;
        if !self.sources.contains_key(&mainfile) {
            bail!("Mainfile '{mainfile}' is not part of the script table");
        }
        let mut scripts = BTreeMap::new();
        for (name, source) in &self.sources {
            let mut ast =
                self.engine.compile(source).with_context(|| format!("Compiling Rhai script '{name}'"))?;
            ast.set_source(name.as_str());
            scripts.insert(name.clone(), ast);
        }
        let mut shared = AST::default();
        for (name, ast) in &scripts {
            if *name != mainfile {
                shared = shared.merge(&ast.clone_functions_only());
            }
        }
        shared = shared.merge(&scripts[&mainfile].clone_functions_only());
        let mut functions = BTreeMap::new();
        for (name, ast) in &scripts {
            let mut library = shared.merge(&ast.clone_functions_only());
            library.set_source(name.as_str());
            functions.insert(name.clone(), library);
        }
        Ok(CompiledScripts { scripts: Rc::new(scripts), mainfile, functions: Rc::new(functions) })
    }
}

fn collect_scripts(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("Reading script directory {}", dir.display()))?;
    for entry in entries {
        let path = entry.with_context(|| format!("Listing {}", dir.display()))?.path();
        if path.is_dir() {
            collect_scripts(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == SCRIPT_EXTENSION) {
            out.push(path);
        }
    }
    out.sort();
    Ok(())
}

fn script_name(relative: &Path) -> String {
    let stem = relative.with_extension("");
    stem.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/")
}

/// Resolves `import "<name>"` against the script table. Modules are evaluated on first import,
/// inside whatever protected call triggered it, and cached for the instance's lifetime.
pub(crate) struct ScriptTableResolver {
    scripts: Rc<BTreeMap<String, AST>>,
    cache: RefCell<HashMap<String, Shared<Module>>>,
}

impl ModuleResolver for ScriptTableResolver {
    fn resolve(
        &self,
        engine: &Engine,
        _source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Shared<Module>, Box<EvalAltResult>> {
        if let Some(module) = self.cache.borrow().get(path) {
            return Ok(module.clone());
        }
        let ast = self
            .scripts
            .get(path)
            .ok_or_else(|| Box::new(EvalAltResult::ErrorModuleNotFound(path.to_string(), pos)))?;
        let module = Module::eval_ast_as_new(Scope::new(), ast, engine)
            .map_err(|err| Box::new(EvalAltResult::ErrorInModule(path.to_string(), err, pos)))?;
        let module: Shared<Module> = module.into();
        self.cache.borrow_mut().insert(path.to_string(), module.clone());
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn compile_requires_a_known_mainfile() {
        let mut loader = ScriptLoader::new(&RuntimeConfig::default());
        loader.add_source("main", "let x = 1;");
        assert!(loader.compile().is_err());
        loader.set_mainfile("other");
        assert!(loader.compile().is_err());
        loader.set_mainfile("main");
        let scripts = loader.compile().expect("compiles");
        assert_eq!(scripts.mainfile(), "main");
        assert_eq!(scripts.main_ast().source(), Some("main"));
    }

    #[test]
    fn compile_errors_name_the_script() {
        let mut loader = ScriptLoader::new(&RuntimeConfig::default());
        loader.add_source("main", "let = ;").set_mainfile("main");
        let err = loader.compile().err().expect("syntax error");
        assert!(format!("{err:#}").contains("'main'"));
    }

    #[test]
    fn entry_script_functions_win_over_libraries() {
        let mut loader = ScriptLoader::new(&RuntimeConfig::default());
        loader
            .add_source("main", "fn pick() { 1 }")
            .add_source("zlib", "fn pick() { 2 } fn helper() { 3 }")
            .set_mainfile("main");
        let scripts = loader.compile().expect("compiles");
        let engine = Engine::new();
        let picked: rhai::INT = engine.call_fn(&mut Scope::new(), scripts.functions(), "pick", ()).unwrap();
        let helper: rhai::INT = engine.call_fn(&mut Scope::new(), scripts.functions(), "helper", ()).unwrap();
        assert_eq!(picked, 1);
        assert_eq!(helper, 3);

        let own: rhai::INT =
            engine.call_fn(&mut Scope::new(), scripts.functions_for(Some("zlib")), "pick", ()).unwrap();
        let fallback: rhai::INT =
            engine.call_fn(&mut Scope::new(), scripts.functions_for(Some("missing")), "pick", ()).unwrap();
        assert_eq!(own, 2);
        assert_eq!(fallback, 1);
        assert_eq!(scripts.functions_for(Some("zlib")).source(), Some("zlib"));
    }

    #[test]
    fn directories_are_loaded_with_relative_names() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("main.rhai"), "let a = 1;").unwrap();
        fs::write(dir.path().join("lib").join("util.rhai"), "fn twice(x) { x * 2 }").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let mut loader = ScriptLoader::new(&RuntimeConfig::default());
        assert_eq!(loader.add_directory(dir.path()).unwrap(), 2);
        loader.set_mainfile("main");
        let scripts = loader.compile().unwrap();
        let names: Vec<_> = scripts.names().cloned().collect();
        assert_eq!(names, vec!["lib/util".to_string(), "main".to_string()]);
    }
}
