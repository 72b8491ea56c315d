use crate::backend::{
    BackendSolution, BackendSolveOptions, IterationObserver, LinearSolverKind, OptimBackend,
};
use crate::factors::reprojection_model::{
    ray_reproj_loop_generic, ray_reproj_point_generic, ray_reproj_pose_point_generic,
    relative_pose_generic, reproj_pinhole4_dist5_chain_generic, stereo_chessboard_generic,
    StereoCorner,
};
use crate::ir::{FactorKind, ManifoldKind, ProblemIR, ResidualBlock, RobustLoss};
use anyhow::{anyhow, ensure, Result};
use log::debug;
use nalgebra::DVector;
use std::collections::HashMap;
use std::sync::Arc;
use tiny_solver::factors::Factor;
use tiny_solver::loss_functions::{ArctanLoss, CauchyLoss, HuberLoss, Loss};
use tiny_solver::manifold::se3::SE3Manifold;
use tiny_solver::optimizer::{Optimizer, OptimizerOptions};
use tiny_solver::problem::Problem;
use tiny_solver::{linear::sparse::LinearSolverType, LevenbergMarquardtOptimizer};

/// tiny-solver backend adapter.
#[derive(Debug, Clone, Copy)]
pub struct TinySolverBackend;

/// A compiled problem together with the initial values of the blocks it uses.
struct Compiled {
    problem: Problem,
    initial: HashMap<String, DVector<f64>>,
}

impl TinySolverBackend {
    /// Compile the IR, skipping parameter blocks no residual references.
    fn compile(
        &self,
        ir: &ProblemIR,
        initial: &HashMap<String, DVector<f64>>,
    ) -> Result<Compiled> {
        ir.validate()?;

        let referenced = ir.referenced_params();
        let mut problem = Problem::new();
        let mut used_initial = HashMap::with_capacity(referenced.len());

        for param in &ir.params {
            let init = initial.get(&param.name).ok_or_else(|| {
                anyhow!(
                    "initial values missing parameter {} (id {:?})",
                    param.name,
                    param.id
                )
            })?;
            ensure!(
                init.len() == param.dim,
                "initial dimension mismatch for {}: expected {}, got {}",
                param.name,
                param.dim,
                init.len()
            );
            if !referenced.contains(&param.id) {
                debug!("parameter {} has no residuals; kept at its initial value", param.name);
                continue;
            }

            match param.manifold {
                ManifoldKind::Euclidean => {}
                ManifoldKind::SE3 => {
                    if param.fixed.is_empty() {
                        problem.set_variable_manifold(&param.name, Arc::new(SE3Manifold));
                    } else if !param.fixed.is_all_fixed(param.dim) {
                        return Err(anyhow!(
                            "tiny-solver cannot partially fix SE3 manifold {}",
                            param.name
                        ));
                    }
                }
            }

            for idx in param.fixed.iter() {
                problem.fix_variable(&param.name, idx);
            }
            used_initial.insert(param.name.clone(), init.clone());
        }

        for residual in &ir.residuals {
            let (factor, loss) = compile_factor(residual)?;
            let param_names: Vec<&str> = residual
                .params
                .iter()
                .map(|id| ir.params[id.0].name.as_str())
                .collect();
            problem.add_residual_block(residual.residual_dim, &param_names, factor, loss);
        }

        Ok(Compiled {
            problem,
            initial: used_initial,
        })
    }
}

fn robust_cost(problem: &Problem, values: &HashMap<String, DVector<f64>>) -> f64 {
    let param_blocks = problem.initialize_parameter_blocks(values);
    let residuals = problem.compute_residuals(&param_blocks, true);
    0.5 * residuals.as_ref().squared_norm_l2()
}

/// Overlay solved blocks onto the full initial map.
fn merge_solution(
    ir: &ProblemIR,
    initial: &HashMap<String, DVector<f64>>,
    mut solved: HashMap<String, DVector<f64>>,
) -> HashMap<String, DVector<f64>> {
    ir.params
        .iter()
        .filter_map(|p| {
            let value = solved
                .remove(&p.name)
                .or_else(|| initial.get(&p.name).cloned())?;
            Some((p.name.clone(), value))
        })
        .collect()
}

impl OptimBackend for TinySolverBackend {
    fn solve(
        &self,
        ir: &ProblemIR,
        initial: &HashMap<String, DVector<f64>>,
        opts: &BackendSolveOptions,
    ) -> Result<BackendSolution> {
        let compiled = self.compile(ir, initial)?;
        if ir.residuals.is_empty() {
            return Ok(BackendSolution {
                params: merge_solution(ir, initial, HashMap::new()),
                final_cost: 0.0,
            });
        }

        let optimizer = LevenbergMarquardtOptimizer::default();
        let options = to_optimizer_options(opts);
        let solution = optimizer
            .optimize(&compiled.problem, &compiled.initial, Some(options))
            .ok_or_else(|| anyhow!("tiny-solver failed to converge"))?;

        let final_cost = robust_cost(&compiled.problem, &solution);
        Ok(BackendSolution {
            params: merge_solution(ir, initial, solution),
            final_cost,
        })
    }

    fn solve_observed(
        &self,
        ir: &ProblemIR,
        initial: &HashMap<String, DVector<f64>>,
        opts: &BackendSolveOptions,
        stride: usize,
        observer: &mut dyn IterationObserver,
    ) -> Result<BackendSolution> {
        ensure!(stride > 0, "observer stride must be positive");
        let compiled = self.compile(ir, initial)?;
        if ir.residuals.is_empty() {
            observer.on_iteration(0, 0.0);
            return Ok(BackendSolution {
                params: merge_solution(ir, initial, HashMap::new()),
                final_cost: 0.0,
            });
        }

        let optimizer = LevenbergMarquardtOptimizer::default();
        let mut current = compiled.initial;
        let mut cost = robust_cost(&compiled.problem, &current);
        observer.on_iteration(0, cost);

        let min_rel = opts.min_rel_decrease.unwrap_or(0.0);
        let min_error = opts.min_error.unwrap_or(0.0);
        let mut done = 0;
        while done < opts.max_iters {
            let chunk = stride.min(opts.max_iters - done);
            let chunk_opts = BackendSolveOptions {
                max_iters: chunk,
                ..opts.clone()
            };
            let next = optimizer
                .optimize(
                    &compiled.problem,
                    &current,
                    Some(to_optimizer_options(&chunk_opts)),
                )
                .ok_or_else(|| anyhow!("tiny-solver failed to converge"))?;
            let next_cost = robust_cost(&compiled.problem, &next);
            done += chunk;
            observer.on_iteration(done, next_cost);

            let rel = if cost > 0.0 {
                (cost - next_cost) / cost
            } else {
                0.0
            };
            current = next;
            cost = next_cost;
            if rel < min_rel || cost <= min_error {
                break;
            }
        }

        Ok(BackendSolution {
            params: merge_solution(ir, initial, current),
            final_cost: cost,
        })
    }
}

fn to_optimizer_options(opts: &BackendSolveOptions) -> OptimizerOptions {
    let mut options = OptimizerOptions {
        max_iteration: opts.max_iters,
        verbosity_level: opts.verbosity,
        ..OptimizerOptions::default()
    };
    if let Some(solver) = opts.linear_solver {
        options.linear_solver_type = match solver {
            LinearSolverKind::SparseCholesky => LinearSolverType::SparseCholesky,
            LinearSolverKind::SparseQR => LinearSolverType::SparseQR,
        };
    }
    if let Some(v) = opts.min_abs_decrease {
        options.min_abs_error_decrease_threshold = v;
    }
    if let Some(v) = opts.min_rel_decrease {
        options.min_rel_error_decrease_threshold = v;
    }
    if let Some(v) = opts.min_error {
        options.min_error_threshold = v;
    }
    options
}

fn compile_robust_loss(loss: RobustLoss) -> Result<Option<Box<dyn Loss + Send>>> {
    match loss {
        RobustLoss::None => Ok(None),
        RobustLoss::Huber { scale } => {
            ensure!(scale > 0.0, "Huber scale must be positive");
            Ok(Some(Box::new(HuberLoss::new(scale))))
        }
        RobustLoss::Cauchy { scale } => {
            ensure!(scale > 0.0, "Cauchy scale must be positive");
            Ok(Some(Box::new(CauchyLoss::new(scale))))
        }
        RobustLoss::Arctan { scale } => {
            ensure!(scale > 0.0, "Arctan scale must be positive");
            Ok(Some(Box::new(ArctanLoss::new(scale))))
        }
    }
}

/// `weight * rho(s)`, with a trivial `rho` when `inner` is `None`.
struct ScaledLoss {
    inner: Option<Box<dyn Loss + Send>>,
    weight: f64,
}

impl Loss for ScaledLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let rho = match &self.inner {
            Some(inner) => inner.evaluate(s),
            None => [s, 1.0, 0.0],
        };
        [self.weight * rho[0], self.weight * rho[1], self.weight * rho[2]]
    }
}

fn compile_loss(loss: RobustLoss, weight: f64) -> Result<Option<Box<dyn Loss + Send>>> {
    ensure!(weight > 0.0, "residual weight must be positive");
    let inner = compile_robust_loss(loss)?;
    if weight == 1.0 {
        return Ok(inner);
    }
    Ok(Some(Box::new(ScaledLoss { inner, weight })))
}

type CompiledFactor = (
    Box<dyn tiny_solver::factors::FactorImpl + Send>,
    Option<Box<dyn Loss + Send>>,
);

fn compile_factor(residual: &ResidualBlock) -> Result<CompiledFactor> {
    let loss = compile_loss(residual.loss, residual.weight)?;
    let factor: Box<dyn tiny_solver::factors::FactorImpl + Send> = match &residual.factor {
        FactorKind::RayReprojPoint {
            cam_from_world,
            obs,
            w,
        } => Box::new(TinyRayPointFactor {
            cam_from_world: *cam_from_world,
            obs: *obs,
            w: *w,
        }),
        FactorKind::RayReprojPosePoint {
            cam_from_sys,
            obs,
            w,
        } => Box::new(TinyRayPosePointFactor {
            cam_from_sys: *cam_from_sys,
            obs: *obs,
            w: *w,
        }),
        FactorKind::RayReprojLoop {
            cam_from_sys,
            point_in_anchor,
            obs,
            w,
        } => Box::new(TinyRayLoopFactor {
            cam_from_sys: *cam_from_sys,
            point_in_anchor: *point_in_anchor,
            obs: *obs,
            w: *w,
        }),
        FactorKind::RelativePose { measured, w } => Box::new(TinyRelativePoseFactor {
            measured: *measured,
            w: *w,
        }),
        FactorKind::ReprojPointPinhole4Dist5Chain { uv, w } => {
            Box::new(TinyReprojChainFactor { uv: *uv, w: *w })
        }
        FactorKind::StereoChessboardPinhole4Dist5 {
            pw,
            uv_left,
            uv_right,
            w,
        } => Box::new(TinyStereoChessboardFactor {
            corner: StereoCorner {
                pw: *pw,
                uv_left: *uv_left,
                uv_right: *uv_right,
                w: *w,
            },
        }),
    };
    Ok((factor, loss))
}

#[derive(Debug, Clone)]
struct TinyRayPointFactor {
    cam_from_world: [f64; 7],
    obs: [f64; 2],
    w: f64,
}

impl<T: nalgebra::RealField> Factor<T> for TinyRayPointFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), 1, "expected [point] parameter block");
        let r = ray_reproj_point_generic(params[0].as_view(), &self.cam_from_world, self.obs, self.w);
        DVector::from_row_slice(r.as_slice())
    }
}

#[derive(Debug, Clone)]
struct TinyRayPosePointFactor {
    cam_from_sys: [f64; 7],
    obs: [f64; 2],
    w: f64,
}

impl<T: nalgebra::RealField> Factor<T> for TinyRayPosePointFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), 2, "expected [pose, point] parameter blocks");
        let r = ray_reproj_pose_point_generic(
            params[0].as_view(), // pose
            params[1].as_view(), // point
            &self.cam_from_sys,
            self.obs,
            self.w,
        );
        DVector::from_row_slice(r.as_slice())
    }
}

#[derive(Debug, Clone)]
struct TinyRayLoopFactor {
    cam_from_sys: [f64; 7],
    point_in_anchor: [f64; 3],
    obs: [f64; 2],
    w: f64,
}

impl<T: nalgebra::RealField> Factor<T> for TinyRayLoopFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), 2, "expected [query, anchor] parameter blocks");
        let r = ray_reproj_loop_generic(
            params[0].as_view(), // query pose
            params[1].as_view(), // anchor pose
            &self.cam_from_sys,
            self.point_in_anchor,
            self.obs,
            self.w,
        );
        DVector::from_row_slice(r.as_slice())
    }
}

#[derive(Debug, Clone)]
struct TinyRelativePoseFactor {
    measured: [f64; 7],
    w: f64,
}

impl<T: nalgebra::RealField> Factor<T> for TinyRelativePoseFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(params.len(), 2, "expected [from, to] parameter blocks");
        let r = relative_pose_generic(params[0].as_view(), params[1].as_view(), &self.measured, self.w);
        DVector::from_row_slice(r.as_slice())
    }
}

#[derive(Debug, Clone)]
struct TinyReprojChainFactor {
    uv: [f64; 2],
    w: f64,
}

impl<T: nalgebra::RealField> Factor<T> for TinyReprojChainFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(
            params.len(),
            5,
            "expected [intr, dist, extr, pose, point] parameter blocks"
        );
        let r = reproj_pinhole4_dist5_chain_generic(
            params[0].as_view(), // intrinsics
            params[1].as_view(), // distortion
            params[2].as_view(), // cam_from_sys
            params[3].as_view(), // sys_from_world
            params[4].as_view(), // point
            self.uv,
            self.w,
        );
        DVector::from_row_slice(r.as_slice())
    }
}

#[derive(Debug, Clone)]
struct TinyStereoChessboardFactor {
    corner: StereoCorner,
}

impl<T: nalgebra::RealField> Factor<T> for TinyStereoChessboardFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(
            params.len(),
            7,
            "expected [intr_l, dist_l, intr_r, dist_r, extr_l, extr_r, board] parameter blocks"
        );
        let r = stereo_chessboard_generic(
            params[0].as_view(),
            params[1].as_view(),
            params[2].as_view(),
            params[3].as_view(),
            params[4].as_view(),
            params[5].as_view(),
            params[6].as_view(),
            &self.corner,
        );
        DVector::from_row_slice(r.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_scales_the_robustified_cost() {
        let w = 10.0;
        let delta = 1.0;
        let huber = compile_loss(RobustLoss::Huber { scale: delta }, 1.0)
            .unwrap()
            .unwrap();
        let scaled = compile_loss(RobustLoss::Huber { scale: delta }, w)
            .unwrap()
            .unwrap();

        // Inlier for the plain loss, and still inlier once weighted.
        let s = 0.5;
        assert_eq!(scaled.evaluate(s)[0], w * s);

        // Outlier: w * (2 delta r - delta^2), not the loss of the scaled residual.
        let s = 9.0;
        let expected = w * (2.0 * delta * 3.0 - delta * delta);
        assert!((scaled.evaluate(s)[0] - expected).abs() < 1e-12);
        assert!((scaled.evaluate(s)[0] - w * huber.evaluate(s)[0]).abs() < 1e-12);
        assert!((scaled.evaluate(s)[1] - w * huber.evaluate(s)[1]).abs() < 1e-12);
        let sqrt_w_inside = huber.evaluate(w * s)[0];
        assert!((scaled.evaluate(s)[0] - sqrt_w_inside).abs() > 1.0);
    }

    #[test]
    fn weight_without_robust_loss_is_quadratic() {
        let loss = compile_loss(RobustLoss::None, 4.0).unwrap().unwrap();
        assert_eq!(loss.evaluate(2.0), [8.0, 4.0, 0.0]);
        assert!(compile_loss(RobustLoss::None, 1.0).unwrap().is_none());
        assert!(compile_loss(RobustLoss::None, 0.0).is_err());
    }
}
