//! Products for the built-in goals.

use std::fmt;

use quarry_process::FallibleProcessResult;
use quarry_store::ContentStore;

use crate::scheduler::RuleError;
use crate::target::Address;
use crate::unions::Union;

/// Union of everything that can validate a target, e.g. linters and
/// typecheckers.
pub enum Check {}
impl Union for Check {}

/// Union of everything that can push a target somewhere, e.g. publishers.
pub enum Deploy {}
impl Union for Deploy {}

/// The outcome of one checker on one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub address: Address,
    pub checker: String,
    pub exit_code: i32,
    pub output: String,
}

impl CheckResult {
    /// Build a result from a finished process, pulling its combined output
    /// back out of the store.
    pub fn from_fallible(
        address: Address,
        checker: impl Into<String>,
        result: &FallibleProcessResult,
        store: &ContentStore,
    ) -> Result<Self, RuleError> {
        Ok(CheckResult {
            address,
            checker: checker.into(),
            exit_code: result.exit_code,
            output: combined_output(result, store)?,
        })
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.success() { "passed" } else { "failed" };
        write!(f, "{} [{}]: {verdict}", self.address, self.checker)?;
        if !self.success() && !self.output.is_empty() {
            write!(f, "\n{}", self.output.trim_end())?;
        }
        Ok(())
    }
}

fn combined_output(
    result: &FallibleProcessResult,
    store: &ContentStore,
) -> Result<String, RuleError> {
    let stdout = store.get_blob(result.stdout_digest)?;
    let stderr = store.get_blob(result.stderr_digest)?;
    let mut output = String::from_utf8_lossy(&stdout).into_owned();
    output.push_str(&String::from_utf8_lossy(&stderr));
    Ok(output)
}

/// Every check outcome for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckResults(pub Vec<CheckResult>);

impl CheckResults {
    /// The first nonzero exit code, or zero when everything passed.
    pub fn exit_code(&self) -> i32 {
        self.0
            .iter()
            .map(|result| result.exit_code)
            .find(|code| *code != 0)
            .unwrap_or(0)
    }

    /// True when nothing applied, i.e. there was nothing to check.
    pub fn skipped(&self) -> bool {
        self.0.is_empty()
    }

    pub fn success(&self) -> bool {
        self.exit_code() == 0
    }
}

impl FromIterator<CheckResult> for CheckResults {
    fn from_iter<I: IntoIterator<Item = CheckResult>>(iter: I) -> Self {
        CheckResults(iter.into_iter().collect())
    }
}

impl fmt::Display for CheckResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for result in &self.0 {
            writeln!(f, "{result}")?;
        }
        Ok(())
    }
}

/// The outcome of one deployer on one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployResult {
    pub address: Address,
    pub deployer: String,
    pub exit_code: i32,
    pub output: String,
}

impl DeployResult {
    pub fn from_fallible(
        address: Address,
        deployer: impl Into<String>,
        result: &FallibleProcessResult,
        store: &ContentStore,
    ) -> Result<Self, RuleError> {
        Ok(DeployResult {
            address,
            deployer: deployer.into(),
            exit_code: result.exit_code,
            output: combined_output(result, store)?,
        })
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl fmt::Display for DeployResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.success() {
            "deployed"
        } else {
            "failed to deploy"
        };
        write!(f, "{} [{}]: {verdict}", self.address, self.deployer)?;
        if !self.output.is_empty() {
            write!(f, "\n{}", self.output.trim_end())?;
        }
        Ok(())
    }
}

/// Every deploy outcome for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployResults(pub Vec<DeployResult>);

impl DeployResults {
    /// The first nonzero exit code, or zero when every deploy succeeded.
    pub fn exit_code(&self) -> i32 {
        self.0
            .iter()
            .map(|result| result.exit_code)
            .find(|code| *code != 0)
            .unwrap_or(0)
    }

    /// True when nothing applied, i.e. there was nothing to deploy.
    pub fn skipped(&self) -> bool {
        self.0.is_empty()
    }

    pub fn success(&self) -> bool {
        self.exit_code() == 0
    }
}

impl FromIterator<DeployResult> for DeployResults {
    fn from_iter<I: IntoIterator<Item = DeployResult>>(iter: I) -> Self {
        DeployResults(iter.into_iter().collect())
    }
}

impl fmt::Display for DeployResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for result in &self.0 {
            writeln!(f, "{result}")?;
        }
        Ok(())
    }
}
