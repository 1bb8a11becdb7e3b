//! End-to-end scenarios exercising mesh, functionals, constraints,
//! optimizers, and refinement together.

use nalgebra::Vector3;

use crate::field::Field;
use crate::functional::elasticity::LinearElasticity;
use crate::functional::evaluate;
use crate::functional::geometry::{Area, AreaEnclosed, Length};
use crate::functional::integrals::ScalarPotential;
use crate::linalg::sparse::Sparse;
use crate::mesh::Mesh;
use crate::optimize::ShapeOptimizer;
use crate::problem::OptimizationProblem;
use crate::refine;
use crate::selection::Selection;

fn square_loop() -> Mesh {
    let mut mesh = Mesh::from_positions(
        3,
        &[1.0, 1.0, 0.0, -1.0, 1.0, 0.0, -1.0, -1.0, 0.0, 1.0, -1.0, 0.0],
    )
    .unwrap();
    for i in 0..4 {
        mesh.add_element(1, &[i, (i + 1) % 4]).unwrap();
    }
    mesh
}

fn triangulated_square() -> Mesh {
    let mut mesh = Mesh::from_positions(2, &[0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0]).unwrap();
    mesh.add_element(2, &[0, 1, 2]).unwrap();
    mesh.add_element(2, &[0, 2, 3]).unwrap();
    mesh.add_grade(1).unwrap();
    mesh
}

#[test]
fn totals_are_insensitive_to_element_insertion_order() {
    let points: Vec<[f64; 3]> = (0..32)
        .map(|i| {
            let t = 2.0 * std::f64::consts::PI * (i as f64) / 32.0;
            [t.cos(), 1.7 * t.sin(), 0.1 * (3.0 * t).sin()]
        })
        .collect();
    let coords: Vec<f64> = points.iter().flatten().copied().collect();

    let mut forward = Mesh::from_positions(3, &coords).unwrap();
    for i in 0..32 {
        forward.add_element(1, &[i, (i + 1) % 32]).unwrap();
    }
    let mut backward = Mesh::from_positions(3, &coords).unwrap();
    for i in (0..32).rev() {
        backward.add_element(1, &[i, (i + 1) % 32]).unwrap();
    }

    let a = evaluate::total(&Length::new(), &forward, &[], None).unwrap();
    let b = evaluate::total(&Length::new(), &backward, &[], None).unwrap();
    assert!((a - b).abs() <= 1e-12 * a.abs());
}

#[test]
fn symmetry_add_equalizes_identified_vertices() {
    // Open chain whose endpoints are identified: vertex 2 is the image of
    // vertex 0.
    let mut mesh = Mesh::from_positions(
        3,
        &[0.0, 0.0, 0.0, 1.0, 0.3, 0.0, 2.0, 0.0, 0.0],
    )
    .unwrap();
    mesh.add_element(1, &[0, 1]).unwrap();
    mesh.add_element(1, &[1, 2]).unwrap();
    let mut sym = Sparse::new(3, 3);
    sym.set(0, 2, 1.0);
    mesh.add_symmetry(0, sym).unwrap();

    let grad = evaluate::gradient(&Length::new(), &mesh, &[], None).unwrap();
    for d in 0..3 {
        assert!(
            (grad[[d, 0]] - grad[[d, 2]]).abs() < 1e-14,
            "identified pair must carry the combined force"
        );
    }
}

/// An elliptical 16-gon around the origin: far from the isoperimetric
/// optimum, so descent has work to do.
fn ellipse_loop() -> Mesh {
    let n = 16;
    let coords: Vec<f64> = (0..n)
        .flat_map(|i| {
            let t = 2.0 * std::f64::consts::PI * (i as f64) / (n as f64);
            [2.0 * t.cos(), t.sin(), 0.0]
        })
        .collect();
    let mut mesh = Mesh::from_positions(3, &coords).unwrap();
    for i in 0..n {
        mesh.add_element(1, &[i, (i + 1) % n]).unwrap();
    }
    mesh
}

/// Perimeter of the regular 16-gon with the given enclosed area, the best
/// any 16-vertex loop can do.
fn regular_16gon_perimeter(area: f64) -> f64 {
    let n = 16.0f64;
    2.0 * (n * (std::f64::consts::PI / n).tan() * area).sqrt()
}

#[test]
fn isoperimetric_descent_conserves_area() {
    let mesh = ellipse_loop();
    let mut problem = OptimizationProblem::new(mesh);
    problem.add_energy(Length::new());
    problem.add_constraint(AreaEnclosed::new()).unwrap();
    let target = problem.constraints()[0].target;

    let perimeter_before = problem.total_energy().unwrap();
    let mut opt = ShapeOptimizer::new();
    opt.opts.quiet = true;
    opt.opts.stepsize = 0.05;
    opt.opts.steplimit = 0.3;
    let report = opt.linesearch(&mut problem, 20).unwrap();

    let area = evaluate::total(&AreaEnclosed::new(), problem.mesh(), &[], None).unwrap();
    assert!((area - target).abs() < 1e-8, "constraint residual {}", area - target);

    let perimeter_after = problem.total_energy().unwrap();
    assert!(perimeter_after < perimeter_before - 0.3);
    assert!(perimeter_after > regular_16gon_perimeter(target) - 1e-3);
    assert!(report.iterations > 0);

    // Energy never rises across accepted line-search steps.
    for pair in opt.energy_history().windows(2) {
        assert!(pair[1] <= pair[0] + 1e-6);
    }
}

#[test]
fn global_reprojection_restores_perturbed_state() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mesh = square_loop();
    let mut problem = OptimizationProblem::new(mesh);
    problem.add_energy(Length::new());
    problem.add_constraint(AreaEnclosed::new()).unwrap();

    // Inflate the loop; the enclosed area rises to 4·1.1².
    let scaled: Vec<f64> = problem.mesh().positions().iter().map(|v| v * 1.1).collect();
    problem.mesh_mut().set_positions(&scaled).unwrap();

    let opt = ShapeOptimizer::new();
    opt.reproject(&mut problem).unwrap();
    let area = evaluate::total(&AreaEnclosed::new(), problem.mesh(), &[], None).unwrap();
    assert!((area - 4.0).abs() < 1e-8);
}

#[test]
fn local_constraint_pins_vertices_to_level_set() {
    let mut mesh = square_loop();
    // Push vertices off the circle of radius √2 they start on.
    mesh.set_vertex(0, &[1.3, 1.1, 0.0]).unwrap();
    mesh.set_vertex(2, &[-0.8, -0.9, 0.0]).unwrap();
    let mut problem = OptimizationProblem::new(mesh);
    problem.add_energy(Length::new());
    problem.add_local_constraint(
        ScalarPotential::with_gradient(
            Box::new(|x| Ok(x[0] * x[0] + x[1] * x[1] - 2.0)),
            Box::new(|x| Ok(Vector3::new(2.0 * x[0], 2.0 * x[1], 0.0))),
        ),
        None,
        false,
        None,
    );

    let opt = ShapeOptimizer::new();
    opt.reproject(&mut problem).unwrap();
    for v in 0..4 {
        let x = problem.mesh().vertex(v);
        let level = x[0] * x[0] + x[1] * x[1] - 2.0;
        assert!(level.abs() < 1e-8, "vertex {v} off the level set by {level}");
    }
}

#[test]
fn onesided_constraint_only_acts_below_target() {
    let mut mesh = Mesh::from_positions(
        3,
        &[0.0, 0.0, -0.4, 1.0, 0.0, 0.7, 2.0, 0.0, -0.1],
    )
    .unwrap();
    mesh.add_element(1, &[0, 1]).unwrap();
    mesh.add_element(1, &[1, 2]).unwrap();
    let mut problem = OptimizationProblem::new(mesh);
    problem.add_energy(Length::new());
    // Floor constraint z ≥ 0.
    problem.add_local_constraint(
        ScalarPotential::with_gradient(
            Box::new(|x| Ok(x[2])),
            Box::new(|_| Ok(Vector3::new(0.0, 0.0, 1.0))),
        ),
        None,
        true,
        None,
    );

    let opt = ShapeOptimizer::new();
    opt.reproject(&mut problem).unwrap();
    assert!(problem.mesh().vertex(0)[2].abs() < 1e-8);
    assert!(problem.mesh().vertex(2)[2].abs() < 1e-8);
    // The vertex already above the floor is untouched.
    assert!((problem.mesh().vertex(1)[2] - 0.7).abs() < 1e-12);
}

#[test]
fn refinement_rebinds_problem_state() {
    let mesh = triangulated_square();
    let mut problem = OptimizationProblem::new(mesh);

    let mut linear = Field::scalar(problem.mesh());
    for v in 0..problem.mesh().vertex_count() {
        let x = problem.mesh().positions()[v * 2];
        linear.set(0, v, 0, 0, x).unwrap();
    }
    let fid = problem.add_field(linear);

    let mut corner = Selection::new();
    corner.select(0, 0);
    let sid = problem.add_selection(corner);

    problem.add_energy(Area::new());
    problem.add_constraint(Area::new()).unwrap();
    let target = problem.constraints()[0].target;

    let refined = refine::refine(problem.mesh(), None).unwrap();
    problem.update(refined).unwrap();

    // Geometry, field, and constraint target all survive the rebind.
    assert_eq!(problem.mesh().count(2), 8);
    assert!((problem.total_energy().unwrap() - 1.0).abs() < 1e-10);
    assert!((problem.constraints()[0].target - target).abs() < 1e-14);
    let field = problem.field(fid).unwrap();
    for v in 0..problem.mesh().vertex_count() {
        let x = problem.mesh().positions()[v * 2];
        assert!((field.get(0, v, 0, 0).unwrap() - x).abs() < 1e-12);
    }
    // The corner vertex kept its id, so the selection still names it.
    assert!(problem.selection(sid).unwrap().is_selected(0, 0));
}

#[test]
fn elasticity_reference_refines_with_the_problem() {
    let mesh = triangulated_square();
    let mut problem = OptimizationProblem::new(mesh.clone());
    problem.add_energy(LinearElasticity::new(mesh));
    assert!(problem.total_energy().unwrap().abs() < 1e-13);

    let refined = refine::refine(problem.mesh(), None).unwrap();
    problem.update(refined).unwrap();

    // Mesh and rebuilt reference still coincide element by element.
    assert!(problem.total_energy().unwrap().abs() < 1e-13);

    // Deforming the refined mesh now costs energy.
    let stretched: Vec<f64> = problem
        .mesh()
        .positions()
        .iter()
        .enumerate()
        .map(|(i, v)| if i % 2 == 0 { v * 1.2 } else { *v })
        .collect();
    problem.mesh_mut().set_positions(&stretched).unwrap();
    assert!(problem.total_energy().unwrap() > 1e-4);
}

#[test]
fn uniformly_refined_loop_preserves_length() {
    let mesh = square_loop();
    let before = evaluate::total(&Length::new(), &mesh, &[], None).unwrap();
    let refined = refine::refine(&mesh, None).unwrap();
    let after = evaluate::total(&Length::new(), &refined.mesh, &[], None).unwrap();
    assert!((before - after).abs() < 1e-10);
    assert_eq!(refined.mesh.count(1), 8);
}

#[test]
fn conjugate_gradient_matches_linesearch_on_isoperimetric_problem() {
    let build = || {
        let mut p = OptimizationProblem::new(ellipse_loop());
        p.add_energy(Length::new());
        p.add_constraint(AreaEnclosed::new()).unwrap();
        p
    };

    let mut p1 = build();
    let start = p1.total_energy().unwrap();
    let floor = regular_16gon_perimeter(p1.constraints()[0].target);
    let mut ls = ShapeOptimizer::new();
    ls.opts.quiet = true;
    ls.opts.stepsize = 0.05;
    ls.opts.steplimit = 0.3;
    ls.linesearch(&mut p1, 15).unwrap();

    let mut p2 = build();
    let mut cg = ShapeOptimizer::new();
    cg.opts.quiet = true;
    cg.opts.stepsize = 0.05;
    cg.opts.steplimit = 0.3;
    cg.conjugate_gradient(&mut p2, 15).unwrap();

    let e1 = p1.total_energy().unwrap();
    let e2 = p2.total_energy().unwrap();
    assert!(e1 < start - 0.3 && e2 < start - 0.3);
    assert!(e1 > floor - 1e-3 && e2 > floor - 1e-3);
}
