use sha2::{Digest, Sha256};

/// Natural-language transformation policy handed to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    /// Rewrite the source into one multi-rank program.
    Cluster { ranks: usize },
    /// Produce a single-core and a cluster variant split by `separator`.
    Dual { ranks: usize, separator: String },
}

const CLUSTER_RULES: &str = "\
Target: convert the Python code below to use 'mpi4py' for a distributed cluster, or analyze its suitability.

[ANALYSIS]
If the code has high sequential dependency or the workload is too small to benefit (e.g. N < 1000):
- return a script that ONLY prints: print(\"NOTIFICATION: <reason it is not suitable>\")
- do NOT parallelize when it would be slower than single-core.

[CONVERSION RULES]
- Use exactly 'from mpi4py import MPI'.
- Include 'import numpy as np', 'import sys' and 'import time'.
- Use dtype=np.int32 for all NumPy arrays exchanged with MPI.INT.
- Use the buffer APIs comm.Scatterv, comm.Gatherv and comm.Sendrecv.
- For sorting, implement a parallel odd-even merge-split sort: local sort, then
  in each of 'size' phases partners exchange entire chunks, merge, and keep the
  lower or upper half by rank. Call .copy() after slicing.
- Print 'Time taken: <seconds> seconds' and 'Result: <summary>' from rank 0.";

const SINGLE_RULES: &str = "\
[SINGLE-CORE VARIANT]
- Keep the original algorithm on one process, without mpi4py.
- Print 'Time taken: <seconds> seconds' and 'Result: <summary>' so both variants are comparable.";

impl Policy {
    pub fn ranks(&self) -> usize {
        match self {
            Policy::Cluster { ranks } | Policy::Dual { ranks, .. } => *ranks,
        }
    }

    /// Assemble the full prompt text; the source is embedded verbatim.
    pub fn render(&self, source: &str) -> String {
        let mut out = String::new();
        out.push_str(CLUSTER_RULES);
        out.push_str(&format!(
            "\n\nContext: {} ranks launched by an MPI launcher.\n",
            self.ranks()
        ));

        match self {
            Policy::Cluster { .. } => {
                out.push_str("\nOUTPUT: return ONLY raw Python code. No markdown, no explanations.\n");
            }
            Policy::Dual { separator, .. } => {
                out.push('\n');
                out.push_str(SINGLE_RULES);
                out.push_str(&format!(
                    "\n\nOUTPUT: return ONLY raw Python code: first the single-core variant, \
then a line containing exactly {separator}, then the cluster variant. \
Use {separator} nowhere else. No markdown, no explanations.\n"
                ));
            }
        }

        out.push_str("\nInput Code:\n");
        out.push_str(source);
        out
    }
}

/// Short stable digest of rendered prompt text for logs.
pub fn hash_prompt(prompt_text: &str) -> String {
    let digest = Sha256::digest(prompt_text.as_bytes());
    hex(&digest[..8])
}

/// Full sha256 hex digest, used to identify staged artifacts.
pub fn digest_code(code: &str) -> String {
    hex(&Sha256::digest(code.as_bytes()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
