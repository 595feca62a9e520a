// Script templates

use std::path::Path;

use crate::config::ScriptConfig;
use crate::types::{StageError, StageResult};

pub const DRIVER_HEADER_FILE: &str = "driver_header.sh";
pub const DEFINE_FILE: &str = "define.sh";
pub const COSMOPREP_FILE: &str = "cosmoprep.sh";
pub const SUBSCRIPT_FILE: &str = "subscript.sh";

const BUILTIN_DRIVER_HEADER: &str = "#!/bin/bash\n\
# Prepares every job directory: coordinate conversion, define, cosmoprep\n\
export PATH=$TURBODIR/scripts:$TURBODIR/bin/`sysname`:$PATH\n";

const BUILTIN_DEFINE: &str = "define << EOF\n\n\na coord\ndesy\nired\n*\nno\nb all def2-TZVP\n*\neht\n\n{charge}\n\nrex\n-int\n*\n-polish\n*\n*\n*\n*\n*\n*\n*\nscf\niter\n200\n\ndft\nfunc\nb3-lyp\non\n\nri\non\n\n*\nEOF\n";

const BUILTIN_COSMOPREP: &str =
    "cosmoprep << EOF\n\n\n\n\n\n\n\n\n\n\n\nr all o\n*\n\n\nEOF\n";

const BUILTIN_SUBSCRIPT: &str = "#!/bin/bash\n\
#\n\
#$ -q speedy\n\
#$ -cwd\n\
#$ -j y\n\
#$ -S /bin/bash\n\
#$ -N {mol_name}\n\
#$ -pe orte 10\n\
#$ -R y\n\
\n\
export TURBODIR=/state/partition1/TURBOMOLE/TURBOMOLE\n\
export PATH=$TURBODIR/scripts:$PATH\n\
export PARA_ARCH=MPI\n\
export PATH=$TURBODIR/bin/`sysname`:$PATH\n\
export PARNODES=10\n\
ulimit -s unlimited\n\
module load openmpi-x86_64\n\
pwd\n\
{job_command} > job.out\n";

/// Scheduler command run by the optimize variant
pub const OPTIMIZE_COMMAND: &str = "jobex -c 400 -ri";
/// Scheduler command run by the standard variant
pub const SINGLE_POINT_COMMAND: &str = "ridft";

/// The four text templates the composer fills in.
///
/// Placeholders: `{charge}` in the define template, `{mol_name}` and
/// `{job_command}` in the submission template.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateSet {
    pub driver_header: String,
    pub define: String,
    pub cosmoprep: String,
    pub subscript: String,
}

impl TemplateSet {
    pub fn builtin() -> Self {
        Self {
            driver_header: BUILTIN_DRIVER_HEADER.to_string(),
            define: BUILTIN_DEFINE.to_string(),
            cosmoprep: BUILTIN_COSMOPREP.to_string(),
            subscript: BUILTIN_SUBSCRIPT.to_string(),
        }
    }

    /// Read all four templates from `dir`; the first absent file is reported
    pub fn load(dir: &Path) -> StageResult<Self> {
        let read = |name: &str| -> StageResult<String> {
            let path = dir.join(name);
            if !path.is_file() {
                return Err(StageError::MissingTemplate(path));
            }
            Ok(std::fs::read_to_string(&path)?)
        };

        Ok(Self {
            driver_header: read(DRIVER_HEADER_FILE)?,
            define: read(DEFINE_FILE)?,
            cosmoprep: read(COSMOPREP_FILE)?,
            subscript: read(SUBSCRIPT_FILE)?,
        })
    }

    pub fn from_config(config: &ScriptConfig) -> StageResult<Self> {
        match &config.template_dir {
            Some(dir) => Self::load(dir),
            None => Ok(Self::builtin()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_placeholders() {
        let templates = TemplateSet::builtin();
        assert!(templates.define.contains("{charge}"));
        assert!(templates.subscript.contains("#$ -N {mol_name}"));
        assert!(templates.subscript.contains("{job_command} > job.out"));
        assert!(templates.driver_header.starts_with("#!/bin/bash"));
    }

    #[test]
    fn test_load_reports_missing_template() {
        let temp_dir = TempDir::new().unwrap();
        for name in [DRIVER_HEADER_FILE, DEFINE_FILE, SUBSCRIPT_FILE] {
            std::fs::write(temp_dir.path().join(name), "x").unwrap();
        }
        match TemplateSet::load(temp_dir.path()) {
            Err(StageError::MissingTemplate(path)) => {
                assert_eq!(path, temp_dir.path().join(COSMOPREP_FILE))
            }
            other => panic!("expected missing template, got {other:?}"),
        }

        std::fs::write(temp_dir.path().join(COSMOPREP_FILE), "cosmoprep").unwrap();
        let templates = TemplateSet::load(temp_dir.path()).unwrap();
        assert_eq!(templates.cosmoprep, "cosmoprep");
    }
}
