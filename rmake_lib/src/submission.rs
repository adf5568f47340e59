use std::{collections::HashSet, io, path::PathBuf};

use rmake_data::RECIPE_FILE_NAME;
use tokio::fs;
use tracing::warn;

use crate::{Error, Result};

/// An uploaded file waiting on disk to be staged under its declared name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputFile {
    pub name: String,
    pub path: PathBuf,
}

impl InputFile {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// A build request that passed validation.
///
/// There is a recipe, at least one source file, and every source name is a
/// plain file name that is unique and differs from the recipe name.
#[derive(Clone, Debug)]
pub struct Submission {
    recipe: InputFile,
    sources: Vec<InputFile>,
    build_args: Vec<String>,
}

impl Submission {
    pub fn new(recipe: InputFile, sources: Vec<InputFile>, build_args: &str) -> Result<Self> {
        if sources.is_empty() {
            return Err(Error::InvalidSubmission(
                "at least one source file is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for source in &sources {
            check_file_name(&source.name).map_err(|reason| {
                Error::InvalidSubmission(format!("source file {:?} {}", source.name, reason))
            })?;
            if !seen.insert(source.name.as_str()) {
                return Err(Error::InvalidSubmission(format!(
                    "source file {:?} submitted twice",
                    source.name
                )));
            }
        }
        let build_args = split_build_args(build_args)?;
        Ok(Self {
            recipe,
            sources,
            build_args,
        })
    }

    pub fn recipe(&self) -> &InputFile {
        &self.recipe
    }

    pub fn sources(&self) -> &[InputFile] {
        &self.sources
    }

    pub fn build_args(&self) -> &[String] {
        &self.build_args
    }

    /// deletes the uploads that were not staged into a workspace
    pub async fn discard(&self) {
        for input in std::iter::once(&self.recipe).chain(&self.sources) {
            match fs::remove_file(&input.path).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!("could not remove upload {}: {}", input.path.display(), err),
            }
        }
    }
}

/// Checks that `name` can only ever address a file directly inside a
/// workspace and does not shadow the recipe.
pub fn check_file_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        Err("has an empty name")
    } else if name == "." || name == ".." {
        Err("is not a file name")
    } else if name.contains(|c: char| c == '/' || c == '\\' || c == '\0') {
        Err("must not contain path separators")
    } else if name == RECIPE_FILE_NAME {
        Err("collides with the recipe file name")
    } else {
        Ok(())
    }
}

/// Splits a free form argument string into an argument vector.
///
/// Arguments are separated by whitespace, single or double quotes group
/// characters including whitespace into one argument. There is no escaping and
/// no other shell syntax, the result is handed to the build program as is.
pub fn split_build_args(args: &str) -> Result<Vec<String>> {
    let mut result = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut quote: Option<char> = None;
    for c in args.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_arg = true;
            }
            None if c.is_whitespace() => {
                if in_arg {
                    result.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            None => {
                current.push(c);
                in_arg = true;
            }
        }
    }
    if quote.is_some() {
        return Err(Error::InvalidSubmission(format!(
            "unterminated quote in build arguments {:?}",
            args
        )));
    }
    if in_arg {
        result.push(current);
    }
    Ok(result)
}

#[cfg(test)]
mod test {
    use super::{check_file_name, split_build_args, InputFile, Submission};
    use crate::Error;

    fn input(name: &str) -> InputFile {
        InputFile::new(name, format!("/spool/{}", name))
    }

    #[test]
    fn test_requires_sources() {
        let result = Submission::new(input("Makefile"), vec![], "");
        assert!(matches!(result, Err(Error::InvalidSubmission(_))));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let result = Submission::new(input("Makefile"), vec![input("a.c"), input("a.c")], "");
        assert!(matches!(result, Err(Error::InvalidSubmission(_))));
    }

    #[test]
    fn test_rejects_recipe_name() {
        let result = Submission::new(input("Makefile"), vec![input("Makefile")], "");
        assert!(matches!(result, Err(Error::InvalidSubmission(_))));
    }

    #[test]
    fn test_file_names() {
        assert!(check_file_name("a.c").is_ok());
        assert!(check_file_name(".hidden").is_ok());
        for bad in ["", ".", "..", "../a.c", "src/a.c", "a\\b", "a\0b", "Makefile"] {
            assert!(check_file_name(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_keeps_order_and_args() {
        let submission =
            Submission::new(input("Makefile"), vec![input("b.c"), input("a.c")], "-j4 all").unwrap();
        let names: Vec<&str> = submission.sources().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(vec!["b.c", "a.c"], names);
        assert_eq!(&["-j4".to_string(), "all".to_string()], submission.build_args());
    }

    #[test]
    fn test_split_build_args() {
        assert!(split_build_args("").unwrap().is_empty());
        assert!(split_build_args("   ").unwrap().is_empty());
        assert_eq!(vec!["-j", "4"], split_build_args(" -j  4 ").unwrap());
        assert_eq!(
            vec!["CFLAGS=-O2 -g", "all"],
            split_build_args("CFLAGS='-O2 -g' all").unwrap()
        );
        assert_eq!(vec!["", "x"], split_build_args(r#""" x"#).unwrap());
        // no shell interpretation
        assert_eq!(vec!["a;", "rm", "-rf"], split_build_args("a; rm -rf").unwrap());
        assert!(split_build_args("'open").is_err());
    }
}
